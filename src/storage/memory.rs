// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process remote cache.
//!
//! Implements [`RemoteCache`] over a single mutex-guarded map with Redis
//! semantics for the commands the engine uses (TTL expiry, empty
//! collections disappear, WRONGTYPE errors, atomic pipelines). Used by the
//! test suite and by single-process deployments without Redis.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::traits::{RemoteCache, RemoteCommand, StorageError, StreamEntry};

#[derive(Debug, Clone)]
enum Data {
    Str(Vec<u8>),
    Hash(HashMap<String, Vec<u8>>),
    List(VecDeque<Vec<u8>>),
    Set(BTreeSet<String>),
    ZSet(Vec<(String, f64)>),
    Stream(Vec<StreamEntry>),
}

impl Data {
    fn is_empty_collection(&self) -> bool {
        match self {
            Data::Str(_) => false,
            Data::Hash(h) => h.is_empty(),
            Data::List(l) => l.is_empty(),
            Data::Set(s) => s.is_empty(),
            Data::ZSet(z) => z.is_empty(),
            Data::Stream(s) => s.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    stream_seq: u64,
}

fn wrong(key: &str) -> StorageError {
    StorageError::WrongType { key: key.to_string() }
}

/// Redis-style inclusive range over a sequence of `len` items.
fn span(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    (start <= stop && start < len).then(|| (start as usize, stop as usize))
}

impl Inner {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .is_some_and(|e| e.expires_at.is_some_and(|t| t <= Instant::now()));
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn read<T>(
        &mut self,
        key: &str,
        missing: T,
        f: impl FnOnce(&Data) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        match self.live(key) {
            Some(entry) => f(&entry.data),
            None => Ok(missing),
        }
    }

    fn write<T>(
        &mut self,
        key: &str,
        empty: impl FnOnce() -> Data,
        f: impl FnOnce(&mut Data) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        self.live(key);
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            data: empty(),
            expires_at: None,
        });
        let out = f(&mut entry.data);
        if entry.data.is_empty_collection() {
            self.entries.remove(key);
        }
        out
    }

    fn set(&mut self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                data: Data::Str(value),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    fn del(&mut self, keys: &[String]) -> u64 {
        keys.iter()
            .filter(|k| {
                let live = self.live(k).is_some();
                self.entries.remove(k.as_str());
                live
            })
            .count() as u64
    }

    fn hset(&mut self, key: &str, field: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.write(key, || Data::Hash(HashMap::new()), |d| match d {
            Data::Hash(h) => {
                h.insert(field.to_string(), value);
                Ok(())
            }
            _ => Err(wrong(key)),
        })
    }

    fn hdel(&mut self, key: &str, fields: &[String]) -> Result<u64, StorageError> {
        if self.live(key).is_none() {
            return Ok(0);
        }
        self.write(key, || Data::Hash(HashMap::new()), |d| match d {
            Data::Hash(h) => Ok(fields.iter().filter(|f| h.remove(f.as_str()).is_some()).count() as u64),
            _ => Err(wrong(key)),
        })
    }

    fn set_members(&mut self, key: &str, members: &[String], add: bool) -> Result<u64, StorageError> {
        if !add && self.live(key).is_none() {
            return Ok(0);
        }
        self.write(key, || Data::Set(BTreeSet::new()), |d| match d {
            Data::Set(s) => Ok(members
                .iter()
                .filter(|m| if add { s.insert(m.to_string()) } else { s.remove(m.as_str()) })
                .count() as u64),
            _ => Err(wrong(key)),
        })
    }

    fn push(&mut self, key: &str, values: &[Vec<u8>], front: bool) -> Result<u64, StorageError> {
        self.write(key, || Data::List(VecDeque::new()), |d| match d {
            Data::List(l) => {
                for v in values {
                    if front {
                        l.push_front(v.clone());
                    } else {
                        l.push_back(v.clone());
                    }
                }
                Ok(l.len() as u64)
            }
            _ => Err(wrong(key)),
        })
    }

    fn xadd(&mut self, stream: &str, fields: &[(String, Vec<u8>)]) -> Result<String, StorageError> {
        self.stream_seq += 1;
        let id = format!("{}-0", self.stream_seq);
        let entry_id = id.clone();
        self.write(stream, || Data::Stream(Vec::new()), |d| match d {
            Data::Stream(s) => {
                s.push((entry_id, fields.to_vec()));
                Ok(())
            }
            _ => Err(wrong(stream)),
        })?;
        Ok(id)
    }

    fn apply(&mut self, command: RemoteCommand) -> Result<(), StorageError> {
        match command {
            RemoteCommand::Set { key, value, ttl } => self.set(&key, value, ttl),
            RemoteCommand::Del { keys } => {
                self.del(&keys);
            }
            RemoteCommand::HSet { key, field, value } => self.hset(&key, &field, value)?,
            RemoteCommand::HDel { key, fields } => {
                self.hdel(&key, &fields)?;
            }
            RemoteCommand::SAdd { key, members } => {
                self.set_members(&key, &members, true)?;
            }
            RemoteCommand::SRem { key, members } => {
                self.set_members(&key, &members, false)?;
            }
            RemoteCommand::RPush { key, values } => {
                self.push(&key, &values, false)?;
            }
            RemoteCommand::XAdd { stream, fields } => {
                self.xadd(&stream, &fields)?;
            }
        }
        Ok(())
    }
}

/// Process-local [`RemoteCache`].
#[derive(Default)]
pub struct MemoryCache {
    inner: Mutex<Inner>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner
            .entries
            .retain(|_, e| e.expires_at.map_or(true, |t| t > now));
        inner.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RemoteCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.lock().read(key, None, |d| match d {
            Data::Str(v) => Ok(Some(v.clone())),
            _ => Err(wrong(key)),
        })
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StorageError> {
        self.inner.lock().set(key, value.to_vec(), ttl);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        if inner.live(key).is_some() {
            return Ok(false);
        }
        inner.set(key, value.to_vec(), Some(ttl));
        Ok(true)
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StorageError> {
        Ok(self.inner.lock().del(keys))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.inner.lock().live(key).is_some())
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        Ok(self
            .inner
            .lock()
            .live(key)
            .and_then(|e| e.expires_at)
            .map(|t| t.saturating_duration_since(Instant::now())))
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, StorageError> {
        let mut inner = self.inner.lock();
        let value = inner.write(key, || Data::Str(b"0".to_vec()), |d| match d {
            Data::Str(raw) => {
                let current: i64 = std::str::from_utf8(raw)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| StorageError::Backend("value is not an integer".into()))?;
                let next = current + delta;
                *raw = next.to_string().into_bytes();
                Ok(next)
            }
            _ => Err(wrong(key)),
        })?;
        if let (Some(ttl), Some(entry)) = (ttl, inner.live(key)) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(value)
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StorageError> {
        self.inner.lock().write(key, || Data::Hash(HashMap::new()), |d| match d {
            Data::Hash(h) => {
                let slot = h.entry(field.to_string()).or_insert_with(|| b"0".to_vec());
                let current: i64 = std::str::from_utf8(slot)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| StorageError::Backend("hash value is not an integer".into()))?;
                *slot = (current + delta).to_string().into_bytes();
                Ok(current + delta)
            }
            _ => Err(wrong(key)),
        })
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.lock().read(key, None, |d| match d {
            Data::Hash(h) => Ok(h.get(field).cloned()),
            _ => Err(wrong(key)),
        })
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>, StorageError> {
        self.inner.lock().read(key, vec![None; fields.len()], |d| match d {
            Data::Hash(h) => Ok(fields.iter().map(|f| h.get(f).cloned()).collect()),
            _ => Err(wrong(key)),
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StorageError> {
        self.inner.lock().hset(key, field, value.to_vec())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, StorageError> {
        self.inner.lock().hdel(key, fields)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        self.inner.lock().read(key, Vec::new(), |d| match d {
            Data::Hash(h) => Ok(h.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            _ => Err(wrong(key)),
        })
    }

    async fn lpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64, StorageError> {
        self.inner.lock().push(key, values, true)
    }

    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64, StorageError> {
        self.inner.lock().push(key, values, false)
    }

    async fn rpop(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut inner = self.inner.lock();
        if inner.live(key).is_none() {
            return Ok(None);
        }
        inner.write(key, || Data::List(VecDeque::new()), |d| match d {
            Data::List(l) => Ok(l.pop_back()),
            _ => Err(wrong(key)),
        })
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>, StorageError> {
        self.inner.lock().read(key, Vec::new(), |d| match d {
            Data::List(l) => Ok(span(l.len(), start, stop)
                .map(|(a, b)| l.range(a..=b).cloned().collect())
                .unwrap_or_default()),
            _ => Err(wrong(key)),
        })
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if inner.live(key).is_none() {
            return Ok(());
        }
        inner.write(key, || Data::List(VecDeque::new()), |d| match d {
            Data::List(l) => {
                match span(l.len(), start, stop) {
                    Some((a, b)) => {
                        l.truncate(b + 1);
                        l.drain(..a);
                    }
                    None => l.clear(),
                }
                Ok(())
            }
            _ => Err(wrong(key)),
        })
    }

    async fn llen(&self, key: &str) -> Result<u64, StorageError> {
        self.inner.lock().read(key, 0, |d| match d {
            Data::List(l) => Ok(l.len() as u64),
            _ => Err(wrong(key)),
        })
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StorageError> {
        self.inner.lock().set_members(key, members, true)
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, StorageError> {
        self.inner.lock().set_members(key, members, false)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StorageError> {
        self.inner.lock().read(key, Vec::new(), |d| match d {
            Data::Set(s) => Ok(s.iter().cloned().collect()),
            _ => Err(wrong(key)),
        })
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StorageError> {
        self.inner.lock().write(key, || Data::ZSet(Vec::new()), |d| match d {
            Data::ZSet(z) => {
                z.retain(|(m, _)| m != member);
                z.push((member.to_string(), score));
                z.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                Ok(())
            }
            _ => Err(wrong(key)),
        })
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StorageError> {
        self.inner.lock().read(key, Vec::new(), |d| match d {
            Data::ZSet(z) => Ok(span(z.len(), start, stop)
                .map(|(a, b)| z[a..=b].iter().map(|(m, _)| m.clone()).collect())
                .unwrap_or_default()),
            _ => Err(wrong(key)),
        })
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError> {
        self.inner.lock().read(key, None, |d| match d {
            Data::ZSet(z) => Ok(z.iter().find(|(m, _)| m == member).map(|(_, s)| *s)),
            _ => Err(wrong(key)),
        })
    }

    async fn xadd(&self, stream: &str, fields: &[(String, Vec<u8>)]) -> Result<String, StorageError> {
        self.inner.lock().xadd(stream, fields)
    }

    async fn xrange(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, StorageError> {
        self.inner.lock().read(stream, Vec::new(), |d| match d {
            Data::Stream(s) => Ok(s.iter().take(count).cloned().collect()),
            _ => Err(wrong(stream)),
        })
    }

    async fn xdel(&self, stream: &str, ids: &[String]) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock();
        if inner.live(stream).is_none() {
            return Ok(0);
        }
        inner.write(stream, || Data::Stream(Vec::new()), |d| match d {
            Data::Stream(s) => {
                let before = s.len();
                s.retain(|(id, _)| !ids.contains(id));
                Ok((before - s.len()) as u64)
            }
            _ => Err(wrong(stream)),
        })
    }

    async fn pipeline(&self, commands: Vec<RemoteCommand>) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        for command in commands {
            inner.apply(command)?;
        }
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        let matches = matches!(inner.live(key), Some(Entry { data: Data::Str(v), .. }) if v.as_slice() == expected);
        if matches {
            inner.entries.remove(key);
        }
        Ok(matches)
    }

    async fn expire_if_equals(&self, key: &str, expected: &[u8], ttl: Duration) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        match inner.live(key) {
            Some(entry) if matches!(&entry.data, Data::Str(v) if v.as_slice() == expected) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|k, _| !k.starts_with(prefix));
        Ok((before - inner.entries.len()) as u64)
    }

    async fn flush_all(&self) -> Result<(), StorageError> {
        self.inner.lock().entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_strings_and_ttl() {
        let cache = MemoryCache::new();
        cache.set("a", b"1", Some(Duration::from_millis(20))).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert!(!cache.set_nx("a", b"2", Duration::from_secs(1)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert!(cache.set_nx("a", b"2", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let cache = MemoryCache::new();
        cache.hset("h", "f", b"v").await.unwrap();
        assert!(matches!(cache.get("h").await, Err(StorageError::WrongType { .. })));
    }

    #[tokio::test]
    async fn test_empty_collections_disappear() {
        let cache = MemoryCache::new();
        cache.sadd("s", &["1".into(), "2".into()]).await.unwrap();
        cache.srem("s", &["1".into(), "2".into()]).await.unwrap();
        assert!(!cache.exists("s").await.unwrap());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_list_range_and_trim() {
        let cache = MemoryCache::new();
        let values: Vec<Vec<u8>> = (1..=5u8).map(|i| vec![i]).collect();
        cache.rpush("l", &values).await.unwrap();
        assert_eq!(cache.lrange("l", 0, 1).await.unwrap(), vec![vec![1], vec![2]]);
        assert_eq!(cache.lrange("l", -2, -1).await.unwrap(), vec![vec![4], vec![5]]);
        cache.ltrim("l", 2, -1).await.unwrap();
        assert_eq!(cache.llen("l").await.unwrap(), 3);
        assert_eq!(cache.rpop("l").await.unwrap(), Some(vec![5]));
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let cache = MemoryCache::new();
        cache.set("lock", b"me", None).await.unwrap();
        assert!(!cache.delete_if_equals("lock", b"you").await.unwrap());
        assert!(cache.expire_if_equals("lock", b"me", Duration::from_secs(5)).await.unwrap());
        assert!(cache.pttl("lock").await.unwrap().is_some());
        assert!(cache.delete_if_equals("lock", b"me").await.unwrap());
        assert!(!cache.exists("lock").await.unwrap());
    }

    #[tokio::test]
    async fn test_pipeline_and_streams() {
        let cache = MemoryCache::new();
        cache
            .pipeline(vec![
                RemoteCommand::HSet { key: "h".into(), field: "1".into(), value: b"x".to_vec() },
                RemoteCommand::SAdd { key: "s".into(), members: vec!["1".into()] },
                RemoteCommand::XAdd { stream: "log".into(), fields: vec![("e".into(), b"{}".to_vec())] },
            ])
            .await
            .unwrap();
        assert_eq!(cache.hget("h", "1").await.unwrap(), Some(b"x".to_vec()));
        assert_eq!(cache.smembers("s").await.unwrap(), vec!["1"]);
        let entries = cache.xrange("log", 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(cache.xdel("log", &[entries[0].0.clone()]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_set_provider() {
        let cache = MemoryCache::new();
        let remote: &dyn RemoteCache = &cache;
        let v = remote.get_set("k", None, || async { Ok(b"computed".to_vec()) }).await.unwrap();
        assert_eq!(v, b"computed");
        let v = remote
            .get_set("k", None, || async { Err(StorageError::Backend("not called".into())) })
            .await
            .unwrap();
        assert_eq!(v, b"computed");
    }
}
