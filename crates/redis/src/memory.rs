//! In-process [`RedisFacade`] for tests and local development.
//!
//! Keeps every data type the repository and strategies touch, expires keys
//! lazily on access (or eagerly through [`MemoryFacade::sweep_expired`]),
//! publishes `__keyevent@0__:expired` once keyspace notifications are
//! enabled, and records each command in a journal.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::cluster::{cross_slot_rename, key_slot};
use crate::config::ClusterMode;
use crate::error::StoreError;
use crate::facade::{KeyType, PubSubMessage, RedisFacade, RenameReply, Subscription, TxOp};

const EXPIRED_CHANNEL: &str = "__keyevent@0__:expired";
const WALL_CLOCK: i64 = i64::MIN;

#[derive(Debug, Clone)]
enum Value {
    String(Vec<u8>),
    Hash(HashMap<String, Vec<u8>>),
    Set(HashSet<String>),
    List(Vec<Vec<u8>>),
    ZSet(HashMap<String, f64>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Hash(_) => "hash",
            Self::Set(_) => "set",
            Self::List(_) => "list",
            Self::ZSet(_) => "zset",
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::String(_) => false,
            Self::Hash(h) => h.is_empty(),
            Self::Set(s) => s.is_empty(),
            Self::List(l) => l.is_empty(),
            Self::ZSet(z) => z.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<i64>,
}

fn wrong_type() -> StoreError {
    StoreError::Backend("WRONGTYPE Operation against a key holding the wrong kind of value".into())
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    expired: Vec<String>,
}

impl Keyspace {
    fn purge(&mut self, key: &str, now: i64) {
        if let Some(entry) = self.entries.get(key)
            && entry.expires_at.is_some_and(|at| at <= now)
        {
            self.entries.remove(key);
            self.expired.push(key.to_owned());
        }
    }

    fn get(&mut self, key: &str, now: i64) -> Option<&mut Entry> {
        self.purge(key, now);
        self.entries.get_mut(key)
    }

    fn value_or_insert(&mut self, key: &str, now: i64, empty: Value) -> &mut Value {
        self.purge(key, now);
        &mut self
            .entries
            .entry(key.to_owned())
            .or_insert(Entry {
                value: empty,
                expires_at: None,
            })
            .value
    }

    fn hash(&mut self, key: &str, now: i64) -> Result<Option<&mut HashMap<String, Vec<u8>>>, StoreError> {
        match self.get(key, now).map(|e| &mut e.value) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(Some(h)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn hash_mut(&mut self, key: &str, now: i64) -> Result<&mut HashMap<String, Vec<u8>>, StoreError> {
        match self.value_or_insert(key, now, Value::Hash(HashMap::new())) {
            Value::Hash(h) => Ok(h),
            _ => Err(wrong_type()),
        }
    }

    fn set(&mut self, key: &str, now: i64) -> Result<Option<&mut HashSet<String>>, StoreError> {
        match self.get(key, now).map(|e| &mut e.value) {
            None => Ok(None),
            Some(Value::Set(s)) => Ok(Some(s)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn set_mut(&mut self, key: &str, now: i64) -> Result<&mut HashSet<String>, StoreError> {
        match self.value_or_insert(key, now, Value::Set(HashSet::new())) {
            Value::Set(s) => Ok(s),
            _ => Err(wrong_type()),
        }
    }

    fn zset(&mut self, key: &str, now: i64) -> Result<Option<&mut HashMap<String, f64>>, StoreError> {
        match self.get(key, now).map(|e| &mut e.value) {
            None => Ok(None),
            Some(Value::ZSet(z)) => Ok(Some(z)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn zset_mut(&mut self, key: &str, now: i64) -> Result<&mut HashMap<String, f64>, StoreError> {
        match self.value_or_insert(key, now, Value::ZSet(HashMap::new())) {
            Value::ZSet(z) => Ok(z),
            _ => Err(wrong_type()),
        }
    }

    /// Drop a collection left empty by a removal, as Redis does.
    fn drop_if_empty(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(|e| e.value.is_empty()) {
            self.entries.remove(key);
        }
    }

    fn apply(&mut self, op: &TxOp, now: i64) -> Result<(), StoreError> {
        match op {
            TxOp::HDel { key, fields } => {
                if let Some(hash) = self.hash(key, now)? {
                    for field in fields {
                        hash.remove(field);
                    }
                }
                self.drop_if_empty(key);
            }
            TxOp::HMSet { key, fields } => {
                let hash = self.hash_mut(key, now)?;
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
            }
            TxOp::Del { key } => {
                self.purge(key, now);
                self.entries.remove(key);
            }
            TxOp::Set { key, value } => {
                self.entries.insert(
                    key.clone(),
                    Entry {
                        value: Value::String(value.clone()),
                        expires_at: None,
                    },
                );
            }
            TxOp::PExpireAt { key, at_ms } => {
                if let Some(entry) = self.get(key, now) {
                    entry.expires_at = Some(*at_ms);
                }
                self.purge(key, now);
            }
            TxOp::Persist { key } => {
                if let Some(entry) = self.get(key, now) {
                    entry.expires_at = None;
                }
            }
            TxOp::SAdd { key, members } => {
                self.set_mut(key, now)?.extend(members.iter().cloned());
            }
            TxOp::SRem { key, members } => {
                if let Some(set) = self.set(key, now)? {
                    for member in members {
                        set.remove(member);
                    }
                }
                self.drop_if_empty(key);
            }
            TxOp::ZAdd { key, member, score } => {
                self.zset_mut(key, now)?.insert(member.clone(), *score);
            }
            TxOp::ZRem { key, member } => {
                if let Some(zset) = self.zset(key, now)? {
                    zset.remove(member);
                }
                self.drop_if_empty(key);
            }
        }
        Ok(())
    }
}

fn sorted_by_score(zset: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut members: Vec<(String, f64)> = zset.iter().map(|(m, s)| (m.clone(), *s)).collect();
    members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    members
}

/// Redis-style glob match supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

struct SubscriberState {
    rx: broadcast::Receiver<(String, String)>,
    token: CancellationToken,
    patterns: Vec<String>,
    channels: Vec<String>,
}

impl SubscriberState {
    fn accept(&self, channel: String, payload: String) -> Option<PubSubMessage> {
        if self.channels.iter().any(|c| *c == channel) {
            return Some(PubSubMessage {
                channel,
                pattern: None,
                payload,
            });
        }
        let pattern = self.patterns.iter().find(|p| glob_match(p, &channel))?.clone();
        Some(PubSubMessage {
            channel,
            pattern: Some(pattern),
            payload,
        })
    }
}

/// In-memory store facade.
pub struct MemoryFacade {
    keyspace: Mutex<Keyspace>,
    clock: AtomicI64,
    journal: Mutex<Vec<String>>,
    events: broadcast::Sender<(String, String)>,
    subscribers: Mutex<CancellationToken>,
    failing_subscriptions: AtomicU32,
    notify_expired: AtomicBool,
    closed: AtomicBool,
    mode: ClusterMode,
}

impl Default for MemoryFacade {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFacade {
    pub fn new() -> Self {
        Self::with_mode(ClusterMode::Single)
    }

    /// Facade reporting `mode`. In [`ClusterMode::Cluster`] renames between
    /// slots are emulated like on a real cluster.
    pub fn with_mode(mode: ClusterMode) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            clock: AtomicI64::new(WALL_CLOCK),
            journal: Mutex::new(Vec::new()),
            events,
            subscribers: Mutex::new(CancellationToken::new()),
            failing_subscriptions: AtomicU32::new(0),
            notify_expired: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            mode,
        }
    }

    /// Freeze the facade clock at `now_ms`.
    pub fn set_time(&self, now_ms: i64) {
        self.clock.store(now_ms, Ordering::SeqCst);
    }

    /// Current facade time in epoch milliseconds.
    pub fn now(&self) -> i64 {
        match self.clock.load(Ordering::SeqCst) {
            WALL_CLOCK => cairn_session::now_ms(),
            frozen => frozen,
        }
    }

    /// Every command executed so far, as `"<COMMAND> <key>"`.
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    /// Command names of the journal, in order.
    pub fn commands(&self) -> Vec<String> {
        self.journal
            .lock()
            .iter()
            .filter_map(|line| line.split_whitespace().next().map(str::to_owned))
            .collect()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    /// All live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = self.now();
        let mut keys: Vec<String> = self
            .keyspace
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| !e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Absolute expiry of `key`, if it has one.
    pub fn expires_at(&self, key: &str) -> Option<i64> {
        self.keyspace.lock().entries.get(key).and_then(|e| e.expires_at)
    }

    /// Expire every key whose deadline has passed, like Redis' active
    /// expiry cycle. Returns how many keys were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.now();
        let expired = {
            let mut keyspace = self.keyspace.lock();
            let due: Vec<String> = keyspace
                .entries
                .iter()
                .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &due {
                keyspace.purge(key, now);
            }
            std::mem::take(&mut keyspace.expired)
        };
        let count = expired.len();
        self.publish_expired(expired);
        count
    }

    /// End all open subscriptions, as a dropped connection would.
    pub fn disconnect_subscribers(&self) {
        let mut token = self.subscribers.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Make the next `n` calls to `subscribe` fail with a connection error.
    pub fn fail_next_subscriptions(&self, n: u32) {
        self.failing_subscriptions.store(n, Ordering::SeqCst);
    }

    fn record(&self, command: &str, key: &str) {
        self.journal.lock().push(format!("{command} {key}"));
    }

    fn publish_expired(&self, keys: Vec<String>) {
        if !self.notify_expired.load(Ordering::SeqCst) {
            return;
        }
        for key in keys {
            let _ = self.events.send((EXPIRED_CHANNEL.to_owned(), key));
        }
    }

    fn run<R>(
        &self,
        command: &str,
        key: &str,
        f: impl FnOnce(&mut Keyspace, i64) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("facade closed".into()));
        }
        self.record(command, key);
        let now = self.now();
        let (result, expired) = {
            let mut keyspace = self.keyspace.lock();
            let result = f(&mut keyspace, now);
            (result, std::mem::take(&mut keyspace.expired))
        };
        self.publish_expired(expired);
        result
    }
}

#[async_trait]
impl RedisFacade for MemoryFacade {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.run("HGET", key, |ks, now| {
            Ok(ks.hash(key, now)?.and_then(|h| h.get(field).cloned()))
        })
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        self.run("HMGET", key, |ks, now| {
            let hash = ks.hash(key, now)?;
            Ok(fields
                .iter()
                .map(|f| hash.as_ref().and_then(|h| h.get(*f).cloned()))
                .collect())
        })
    }

    async fn hget_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.run("HGETALL", key, |ks, now| {
            Ok(ks
                .hash(key, now)?
                .map(|h| h.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
                .unwrap_or_default())
        })
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.run("HKEYS", key, |ks, now| {
            Ok(ks
                .hash(key, now)?
                .map(|h| h.keys().cloned().collect())
                .unwrap_or_default())
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StoreError> {
        self.run("HSET", key, |ks, now| {
            ks.hash_mut(key, now)?.insert(field.to_owned(), value.to_vec());
            Ok(())
        })
    }

    async fn hmset(&self, key: &str, fields: &[(String, Vec<u8>)]) -> Result<(), StoreError> {
        self.run("HMSET", key, |ks, now| {
            let hash = ks.hash_mut(key, now)?;
            for (field, value) in fields {
                hash.insert(field.clone(), value.clone());
            }
            Ok(())
        })
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &[u8]) -> Result<bool, StoreError> {
        self.run("HSETNX", key, |ks, now| {
            let hash = ks.hash_mut(key, now)?;
            if hash.contains_key(field) {
                return Ok(false);
            }
            hash.insert(field.to_owned(), value.to_vec());
            Ok(true)
        })
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, StoreError> {
        self.run("HDEL", key, |ks, now| {
            let removed = match ks.hash(key, now)? {
                Some(hash) => fields.iter().filter(|f| hash.remove(*f).is_some()).count(),
                None => 0,
            };
            ks.drop_if_empty(key);
            Ok(removed as u64)
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.run("GET", key, |ks, now| match ks.get(key, now).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::String(v)) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type()),
        })
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.run("SET", key, |ks, now| {
            ks.apply(
                &TxOp::Set {
                    key: key.to_owned(),
                    value: value.to_vec(),
                },
                now,
            )
        })
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.run("DEL", &keys.join(" "), |ks, now| {
            let mut removed = 0;
            for key in keys {
                ks.purge(key, now);
                if ks.entries.remove(key).is_some() {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.run("EXISTS", key, |ks, now| Ok(ks.get(key, now).is_some()))
    }

    async fn key_type(&self, key: &str) -> Result<KeyType, StoreError> {
        self.run("TYPE", key, |ks, now| {
            Ok(KeyType::from(
                ks.get(key, now).map_or("none", |e| e.value.type_name()),
            ))
        })
    }

    async fn pexpire(&self, key: &str, ttl_ms: i64) -> Result<bool, StoreError> {
        self.run("PEXPIRE", key, |ks, now| {
            let found = ks.get(key, now).map(|e| e.expires_at = Some(now + ttl_ms)).is_some();
            ks.purge(key, now);
            Ok(found)
        })
    }

    async fn pexpire_at(&self, key: &str, at_ms: i64) -> Result<bool, StoreError> {
        self.run("PEXPIREAT", key, |ks, now| {
            let found = ks.get(key, now).map(|e| e.expires_at = Some(at_ms)).is_some();
            ks.purge(key, now);
            Ok(found)
        })
    }

    async fn pttl(&self, key: &str) -> Result<i64, StoreError> {
        self.run("PTTL", key, |ks, now| {
            Ok(match ks.get(key, now) {
                None => -2,
                Some(Entry { expires_at: None, .. }) => -1,
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => *at - now,
            })
        })
    }

    async fn persist(&self, key: &str) -> Result<bool, StoreError> {
        self.run("PERSIST", key, |ks, now| {
            Ok(ks
                .get(key, now)
                .is_some_and(|e| e.expires_at.take().is_some()))
        })
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        self.run("SADD", key, |ks, now| {
            let set = ks.set_mut(key, now)?;
            Ok(members.iter().filter(|m| set.insert((*m).clone())).count() as u64)
        })
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        self.run("SREM", key, |ks, now| {
            let removed = match ks.set(key, now)? {
                Some(set) => members.iter().filter(|m| set.remove(*m)).count(),
                None => 0,
            };
            ks.drop_if_empty(key);
            Ok(removed as u64)
        })
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.run("SMEMBERS", key, |ks, now| {
            let mut members: Vec<String> = ks
                .set(key, now)?
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default();
            members.sort();
            Ok(members)
        })
    }

    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64, StoreError> {
        self.run("RPUSH", key, |ks, now| {
            match ks.value_or_insert(key, now, Value::List(Vec::new())) {
                Value::List(list) => {
                    list.extend(values.iter().cloned());
                    Ok(list.len() as u64)
                }
                _ => Err(wrong_type()),
            }
        })
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Vec<u8>>, StoreError> {
        self.run("LRANGE", key, |ks, now| {
            let list = match ks.get(key, now).map(|e| &e.value) {
                None => return Ok(Vec::new()),
                Some(Value::List(list)) => list,
                Some(_) => return Err(wrong_type()),
            };
            let len = isize::try_from(list.len()).unwrap_or(isize::MAX);
            let norm = |i: isize| if i < 0 { (len + i).max(0) } else { i };
            let (from, to) = (norm(start), norm(stop).min(len - 1));
            if from > to {
                return Ok(Vec::new());
            }
            let from = usize::try_from(from).unwrap_or(0);
            let to = usize::try_from(to).unwrap_or(0);
            Ok(list[from..=to].to_vec())
        })
    }

    async fn zadd(&self, key: &str, members: &[(f64, String)]) -> Result<u64, StoreError> {
        self.run("ZADD", key, |ks, now| {
            let zset = ks.zset_mut(key, now)?;
            let mut added = 0;
            for (score, member) in members {
                if zset.insert(member.clone(), *score).is_none() {
                    added += 1;
                }
            }
            Ok(added)
        })
    }

    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        self.run("ZREM", key, |ks, now| {
            let removed = match ks.zset(key, now)? {
                Some(zset) => members.iter().filter(|m| zset.remove(*m).is_some()).count(),
                None => 0,
            };
            ks.drop_if_empty(key);
            Ok(removed as u64)
        })
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>, StoreError> {
        self.run("ZRANGEBYSCORE", key, |ks, now| {
            Ok(ks
                .zset(key, now)?
                .map(|z| {
                    sorted_by_score(z)
                        .into_iter()
                        .filter(|(_, s)| *s >= min && *s <= max)
                        .map(|(m, _)| m)
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError> {
        self.run("ZRANGE", key, |ks, now| {
            Ok(ks.zset(key, now)?.map(|z| sorted_by_score(z)).unwrap_or_default())
        })
    }

    async fn zpop_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>, StoreError> {
        self.run("ZPOPBYSCORE", key, |ks, now| {
            let popped: Vec<String> = match ks.zset(key, now)? {
                Some(zset) => {
                    let due: Vec<String> = sorted_by_score(zset)
                        .into_iter()
                        .filter(|(_, s)| *s >= min && *s <= max)
                        .map(|(m, _)| m)
                        .collect();
                    for member in &due {
                        zset.remove(member);
                    }
                    due
                }
                None => Vec::new(),
            };
            ks.drop_if_empty(key);
            Ok(popped)
        })
    }

    async fn rename(&self, old_key: &str, new_key: &str) -> Result<RenameReply, StoreError> {
        if self.mode == ClusterMode::Cluster && key_slot(old_key) != key_slot(new_key) {
            return cross_slot_rename(self, old_key, new_key).await;
        }
        self.run("RENAME", old_key, |ks, now| {
            ks.purge(old_key, now);
            match ks.entries.remove(old_key) {
                Some(entry) => {
                    ks.entries.insert(new_key.to_owned(), entry);
                    Ok(RenameReply::Ok)
                }
                None => Ok(RenameReply::Err),
            }
        })
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        self.run("PUBLISH", channel, |_, _| Ok(()))?;
        let _ = self.events.send((channel.to_owned(), message.to_owned()));
        Ok(())
    }

    async fn subscribe(
        &self,
        patterns: &[String],
        channels: &[String],
    ) -> Result<Subscription, StoreError> {
        self.run("SUBSCRIBE", &channels.join(" "), |_, _| Ok(()))?;
        let failing = self
            .failing_subscriptions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Connection("subscription refused".into()));
        }
        let state = SubscriberState {
            rx: self.events.subscribe(),
            token: self.subscribers.lock().clone(),
            patterns: patterns.to_vec(),
            channels: channels.to_vec(),
        };
        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                tokio::select! {
                    () = state.token.cancelled() => return None,
                    received = state.rx.recv() => match received {
                        Ok((channel, payload)) => {
                            if let Some(message) = state.accept(channel, payload) {
                                return Some((message, state));
                            }
                        }
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => return None,
                    },
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn transaction(&self, pinned_key: &str, ops: Vec<TxOp>) -> Result<(), StoreError> {
        self.run("MULTI", pinned_key, |ks, now| {
            // Validate types first so a failing op leaves nothing applied.
            let mut staged = Keyspace {
                entries: ks.entries.clone(),
                expired: Vec::new(),
            };
            for op in ops.iter().filter(|op| !op.is_noop()) {
                staged.apply(op, now)?;
            }
            *ks = Keyspace {
                entries: staged.entries,
                expired: std::mem::take(&mut ks.expired).into_iter().chain(staged.expired).collect(),
            };
            Ok(())
        })?;
        let mut journal = self.journal.lock();
        for op in &ops {
            journal.push(format!("{} {}", op_name(op), op.key()));
        }
        journal.push(format!("EXEC {pinned_key}"));
        Ok(())
    }

    async fn configure_keyspace_notifications(&self) -> Result<(), StoreError> {
        self.run("CONFIG", "notify-keyspace-events", |_, _| Ok(()))?;
        self.notify_expired.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn mode(&self) -> ClusterMode {
        self.mode
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers.lock().cancel();
    }
}

fn op_name(op: &TxOp) -> &'static str {
    match op {
        TxOp::HDel { .. } => "HDEL",
        TxOp::HMSet { .. } => "HMSET",
        TxOp::Del { .. } => "DEL",
        TxOp::Set { .. } => "SET",
        TxOp::PExpireAt { .. } => "PEXPIREAT",
        TxOp::Persist { .. } => "PERSIST",
        TxOp::SAdd { .. } => "SADD",
        TxOp::SRem { .. } => "SREM",
        TxOp::ZAdd { .. } => "ZADD",
        TxOp::ZRem { .. } => "ZREM",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn keys_expire_lazily_and_notify() {
        let facade = MemoryFacade::new();
        facade.set_time(1_000);
        facade.configure_keyspace_notifications().await.unwrap();
        let mut sub = facade
            .subscribe(&["__keyevent@*__:expired".to_owned()], &[])
            .await
            .unwrap();

        facade.set("k", b"v").await.unwrap();
        assert!(facade.pexpire("k", 500).await.unwrap());
        assert_eq!(facade.pttl("k").await.unwrap(), 500);

        facade.set_time(1_500);
        assert!(!facade.exists("k").await.unwrap());
        let message = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, "k");
        assert_eq!(message.pattern.as_deref(), Some("__keyevent@*__:expired"));
    }

    #[tokio::test]
    async fn sweep_expires_untouched_keys() {
        let facade = MemoryFacade::new();
        facade.set_time(0);
        facade.set("a", b"1").await.unwrap();
        facade.set("b", b"2").await.unwrap();
        facade.pexpire_at("a", 10).await.unwrap();
        facade.set_time(10);
        assert_eq!(facade.sweep_expired(), 1);
        assert_eq!(facade.keys(), vec!["b"]);
    }

    #[tokio::test]
    async fn transaction_is_all_or_nothing() {
        let facade = MemoryFacade::new();
        facade.set("plain", b"x").await.unwrap();

        let err = facade
            .transaction(
                "h",
                vec![
                    TxOp::HMSet {
                        key: "h".into(),
                        fields: vec![("f".into(), b"1".to_vec())],
                    },
                    TxOp::SAdd {
                        key: "plain".into(),
                        members: vec!["m".into()],
                    },
                ],
            )
            .await;
        assert!(err.is_err());
        assert!(!facade.exists("h").await.unwrap());
    }

    #[tokio::test]
    async fn zpop_removes_due_members() {
        let facade = MemoryFacade::new();
        facade
            .zadd(
                "z",
                &[(1.0, "a".into()), (5.0, "b".into()), (9.0, "c".into())],
            )
            .await
            .unwrap();
        let popped = facade.zpop_by_score("z", f64::NEG_INFINITY, 5.0).await.unwrap();
        assert_eq!(popped, vec!["a", "b"]);
        assert_eq!(facade.zrange_with_scores("z").await.unwrap(), vec![("c".to_owned(), 9.0)]);
    }

    #[tokio::test]
    async fn rename_missing_key_is_err() {
        let facade = MemoryFacade::new();
        assert_eq!(facade.rename("nope", "x").await.unwrap(), RenameReply::Err);
        facade.hset("old", "f", b"v").await.unwrap();
        assert_eq!(facade.rename("old", "new").await.unwrap(), RenameReply::Ok);
        assert_eq!(facade.hget("new", "f").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn channels_and_disconnects() {
        let facade = MemoryFacade::new();
        let mut sub = facade.subscribe(&[], &["chan".to_owned()]).await.unwrap();
        facade.publish("other", "ignored").await.unwrap();
        facade.publish("chan", "a:b").await.unwrap();
        let message = sub.next().await.unwrap();
        assert_eq!(message.payload, "a:b");
        assert_eq!(message.pattern, None);

        facade.disconnect_subscribers();
        assert!(sub.next().await.is_none());

        facade.fail_next_subscriptions(1);
        assert!(facade.subscribe(&[], &["chan".to_owned()]).await.is_err());
        assert!(facade.subscribe(&[], &["chan".to_owned()]).await.is_ok());
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("__keyevent@*__:expired", "__keyevent@0__:expired"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a*d", "abc"));
        assert!(glob_match("*", ""));
    }
}
