//! Lua scripts backing the atomic queue operations (spec §4.2 "Concurrency":
//! "all mutations of one item are serialised via the backing store's atomic
//! primitives"), following the `redis::Script` idiom shown in the pack's
//! `apalis-redis` storage reference file.

use redis::Script;

#[derive(Clone)]
pub struct QueueScripts {
    pub enqueue: Script,
    pub reserve: Script,
    pub complete: Script,
    pub fail: Script,
    pub recover_stalled: Script,
}

impl Default for QueueScripts {
    fn default() -> Self {
        Self {
            enqueue: Script::new(include_str!("../lua/enqueue.lua")),
            reserve: Script::new(include_str!("../lua/reserve.lua")),
            complete: Script::new(include_str!("../lua/complete.lua")),
            fail: Script::new(include_str!("../lua/fail.lua")),
            recover_stalled: Script::new(include_str!("../lua/recover_stalled.lua")),
        }
    }
}

/// Key names for one named queue's Redis footprint, namespaced under
/// `relay:{queue}:*`.
pub struct QueueKeys {
    pub data: String,
    pub waiting: String,
    pub delayed: String,
    pub active: String,
    pub meta: String,
    pub seq: String,
    pub completed: String,
    pub failed: String,
    pub paused: String,
    pub stalled_count: String,
}

impl QueueKeys {
    pub fn for_queue(queue: &str) -> Self {
        let prefix = format!("relay:{queue}");
        Self {
            data: format!("{prefix}:data"),
            waiting: format!("{prefix}:waiting"),
            delayed: format!("{prefix}:delayed"),
            active: format!("{prefix}:active"),
            meta: format!("{prefix}:meta"),
            seq: format!("{prefix}:seq"),
            completed: format!("{prefix}:completed"),
            failed: format!("{prefix}:failed"),
            paused: format!("{prefix}:paused"),
            stalled_count: format!("{prefix}:stalled_count"),
        }
    }
}
