//! Deterministic in-process [`CoordinationStore`].
//!
//! One `std::sync::Mutex` over the whole key space makes every operation
//! atomic, matching the per-command atomicity the production store gives.
//! Expiry is lazy: an entry past its deadline is removed the next time any
//! operation touches its key.

use flashsale_core::{CoordinationStore, StoreError, StoreFuture};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// What a key currently holds. Mirrors the store's value kinds: plain
/// strings (also used as counters), lists, and scored sets.
#[derive(Debug, Clone)]
enum Slot {
    Text(String),
    List(VecDeque<String>),
    Scored(HashMap<String, f64>),
}

impl Slot {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "string",
            Self::List(_) => "list",
            Self::Scored(_) => "scored set",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory coordination store with per-operation atomicity and lazy TTL.
#[derive(Debug, Default)]
pub struct InMemoryCoordinationStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryCoordinationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        match self.entries.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drop `key` if its entry has expired, then return a live mutable
    /// reference if one remains.
    fn live<'t>(
        table: &'t mut HashMap<String, Entry>,
        key: &str,
    ) -> Option<&'t mut Entry> {
        if table.get(key).is_some_and(|e| e.expired(Instant::now())) {
            table.remove(key);
        }
        table.get_mut(key)
    }

    fn wrong_kind(key: &str, found: &Slot, wanted: &'static str) -> StoreError {
        StoreError::Backend(format!(
            "key {key} holds a {}, operation needs a {wanted}",
            found.kind()
        ))
    }

    /// Add `delta` to the counter at `key`; a missing key counts as 0.
    /// An existing TTL is preserved, matching counter semantics upstream.
    fn add_to_counter(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut table = self.table();
        match Self::live(&mut table, key) {
            None => {
                table.insert(
                    key.to_owned(),
                    Entry {
                        slot: Slot::Text(delta.to_string()),
                        expires_at: None,
                    },
                );
                Ok(delta)
            }
            Some(entry) => match &mut entry.slot {
                Slot::Text(text) => {
                    let current: i64 =
                        text.parse().map_err(|_| StoreError::InvalidValue {
                            key: key.to_owned(),
                            value: text.clone(),
                        })?;
                    let next = current + delta;
                    *text = next.to_string();
                    Ok(next)
                }
                other => Err(Self::wrong_kind(key, other, "string")),
            },
        }
    }
}

impl CoordinationStore for InMemoryCoordinationStore {
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut table = self.table();
            if Self::live(&mut table, key).is_some() {
                return Ok(false);
            }
            table.insert(
                key.to_owned(),
                Entry {
                    slot: Slot::Text(value.to_owned()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(true)
        })
    }

    fn delete_if_equals<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut table = self.table();
            let matches = match Self::live(&mut table, key) {
                Some(Entry {
                    slot: Slot::Text(text),
                    ..
                }) => text == value,
                _ => false,
            };
            if matches {
                table.remove(key);
            }
            Ok(matches)
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.table().insert(
                key.to_owned(),
                Entry {
                    slot: Slot::Text(value.to_owned()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut table = self.table();
            match Self::live(&mut table, key) {
                Some(Entry {
                    slot: Slot::Text(text),
                    ..
                }) => Ok(Some(text.clone())),
                Some(entry) => Err(Self::wrong_kind(key, &entry.slot, "string")),
                None => Ok(None),
            }
        })
    }

    fn increment<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64> {
        Box::pin(async move { self.add_to_counter(key, 1) })
    }

    fn decrement<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64> {
        Box::pin(async move { self.add_to_counter(key, -1) })
    }

    fn add_if_absent<'a>(
        &'a self,
        key: &'a str,
        member: &'a str,
        score: f64,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut table = self.table();
            match Self::live(&mut table, key) {
                None => {
                    let mut members = HashMap::new();
                    members.insert(member.to_owned(), score);
                    table.insert(
                        key.to_owned(),
                        Entry {
                            slot: Slot::Scored(members),
                            expires_at: None,
                        },
                    );
                    Ok(true)
                }
                Some(entry) => match &mut entry.slot {
                    Slot::Scored(members) => {
                        if members.contains_key(member) {
                            Ok(false)
                        } else {
                            members.insert(member.to_owned(), score);
                            Ok(true)
                        }
                    }
                    other => Err(Self::wrong_kind(key, other, "scored set")),
                },
            }
        })
    }

    fn remove_member<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut table = self.table();
            match Self::live(&mut table, key) {
                None => Ok(false),
                Some(entry) => match &mut entry.slot {
                    Slot::Scored(members) => Ok(members.remove(member).is_some()),
                    other => Err(Self::wrong_kind(key, other, "scored set")),
                },
            }
        })
    }

    fn member_score<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, Option<f64>> {
        Box::pin(async move {
            let mut table = self.table();
            match Self::live(&mut table, key) {
                None => Ok(None),
                Some(entry) => match &entry.slot {
                    Slot::Scored(members) => Ok(members.get(member).copied()),
                    other => Err(Self::wrong_kind(key, other, "scored set")),
                },
            }
        })
    }

    fn push_back<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut table = self.table();
            match Self::live(&mut table, key) {
                None => {
                    let mut list = VecDeque::new();
                    list.push_back(value.to_owned());
                    table.insert(
                        key.to_owned(),
                        Entry {
                            slot: Slot::List(list),
                            expires_at: None,
                        },
                    );
                    Ok(())
                }
                Some(entry) => match &mut entry.slot {
                    Slot::List(list) => {
                        list.push_back(value.to_owned());
                        Ok(())
                    }
                    other => Err(Self::wrong_kind(key, other, "list")),
                },
            }
        })
    }

    fn push_front<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut table = self.table();
            match Self::live(&mut table, key) {
                None => {
                    let mut list = VecDeque::new();
                    list.push_front(value.to_owned());
                    table.insert(
                        key.to_owned(),
                        Entry {
                            slot: Slot::List(list),
                            expires_at: None,
                        },
                    );
                    Ok(())
                }
                Some(entry) => match &mut entry.slot {
                    Slot::List(list) => {
                        list.push_front(value.to_owned());
                        Ok(())
                    }
                    other => Err(Self::wrong_kind(key, other, "list")),
                },
            }
        })
    }

    fn pop_front<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut table = self.table();
            match Self::live(&mut table, key) {
                None => Ok(None),
                Some(entry) => match &mut entry.slot {
                    Slot::List(list) => {
                        let head = list.pop_front();
                        if list.is_empty() {
                            table.remove(key);
                        }
                        Ok(head)
                    }
                    other => Err(Self::wrong_kind(key, other, "list")),
                },
            }
        })
    }

    fn list_len<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut table = self.table();
            match Self::live(&mut table, key) {
                None => Ok(0),
                Some(entry) => match &entry.slot {
                    Slot::List(list) => Ok(list.len() as u64),
                    other => Err(Self::wrong_kind(key, other, "list")),
                },
            }
        })
    }

    fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut table = self.table();
            if let Some(entry) = Self::live(&mut table, key) {
                entry.expires_at = Some(Instant::now() + ttl);
            }
            Ok(())
        })
    }
}
