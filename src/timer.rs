use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::{Duration, Instant},
};

/// One-shot timer wheel with cancellation.
///
/// Entries are ordered by deadline; `poll` drains everything due at or
/// before `now`. The wheel itself never sleeps, the owner decides how
/// often to poll it, which also lets tests drive it with a virtual clock.
pub struct Timer<T> {
    entries: RwLock<BTreeMap<(Instant, u64), T>>,
    deadlines: RwLock<HashMap<u64, Instant>>,
    next_id: AtomicU64,
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            entries: RwLock::new(BTreeMap::new()),
            deadlines: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn schedule(&self, delay: Duration, value: T) -> u64 {
        self.schedule_at(Instant::now() + delay, value)
    }

    pub fn schedule_at(&self, fire_at: Instant, value: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .write()
            .as_mut()
            .map(|e| e.insert((fire_at, id), value))
            .ok();
        self.deadlines
            .write()
            .as_mut()
            .map(|d| d.insert(id, fire_at))
            .ok();
        id
    }

    pub fn cancel(&self, id: u64) -> Option<T> {
        let fire_at = self
            .deadlines
            .write()
            .as_mut()
            .map(|d| d.remove(&id))
            .ok()
            .flatten()?;
        self.entries
            .write()
            .as_mut()
            .map(|e| e.remove(&(fire_at, id)))
            .ok()
            .flatten()
    }

    pub fn poll(&self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        let mut entries = match self.entries.write() {
            Ok(entries) => entries,
            Err(_) => return due,
        };
        let keys = entries
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();
        if keys.is_empty() {
            return due;
        }
        due.reserve(keys.len());
        for key in keys.iter() {
            if let Some(value) = entries.remove(key) {
                due.push(value);
            }
        }
        drop(entries);
        if let Ok(deadlines) = self.deadlines.write().as_mut() {
            for (_, id) in keys {
                deadlines.remove(&id);
            }
        }
        due
    }
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn test_timer() {
    let timer = Timer::new();
    let now = Instant::now();

    let id = timer.schedule_at(now, "refresh");
    assert_eq!(id, 1);
    assert_eq!(timer.cancel(id), Some("refresh"));
    assert_eq!(timer.cancel(id), None);

    timer.schedule_at(now, "expiry");
    assert_eq!(timer.poll(now + Duration::from_secs(1)), vec!["expiry"]);

    timer.schedule_at(now + Duration::from_millis(1001), "late");
    assert!(timer.poll(now + Duration::from_secs(1)).is_empty());
    assert_eq!(timer.len(), 1);
}

#[test]
fn test_timer_poll_order() {
    let timer = Timer::new();
    let now = Instant::now();
    timer.schedule_at(now + Duration::from_secs(3), "c");
    timer.schedule_at(now + Duration::from_secs(1), "a");
    timer.schedule_at(now + Duration::from_secs(2), "b");
    assert_eq!(timer.poll(now + Duration::from_secs(3)), vec!["a", "b", "c"]);
    assert!(timer.is_empty());
}
