//! Lua scripts for transitions that must be atomic on the Redis side.
//!
//! Key layout per queue (`{prefix}:{queue}:…`): `wait` zset scored by
//! priority then id, `delayed` zset scored by ready time (ms), `active` zset
//! scored by lease expiry (ms), `completed` / `failed` zsets scored by finish
//! time (ms), `paused` flag, and one hash per job at `job:{id}`.
//!
//! The maintenance and claim scripts share one calling convention.
//! KEYS: wait, delayed, active, paused, failed.
//! ARGV: now_ms, job_key_prefix, stalled_reason, default_lease_ms.

use redis::Script;

/// Takes back active jobs whose lease expired. The lost attempt is counted;
/// a job with none left goes to `failed`, otherwise it is due again at once.
const RECOVER_STALLED: &str = r#"
local stalled = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
for _, id in ipairs(stalled) do
  redis.call('ZREM', KEYS[3], id)
  local key = ARGV[2] .. id
  if redis.call('EXISTS', key) == 1 then
    local attempts = redis.call('HINCRBY', key, 'attempts', 1)
    local max = tonumber(redis.call('HGET', key, 'max_attempts') or '1') or 1
    if attempts >= max then
      redis.call('HSET', key, 'state', 'failed', 'finished_at', ARGV[1], 'reason', ARGV[3])
      redis.call('ZADD', KEYS[5], ARGV[1], id)
    else
      redis.call('HSET', key, 'state', 'delayed', 'reason', ARGV[3])
      redis.call('ZADD', KEYS[2], ARGV[1], id)
    end
  end
end
"#;

/// Moves due delayed jobs to `wait`.
const PROMOTE_DUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  local key = ARGV[2] .. id
  if redis.call('EXISTS', key) == 1 then
    local priority = tonumber(redis.call('HGET', key, 'priority') or '0') or 0
    redis.call('HSET', key, 'state', 'waiting')
    redis.call('ZADD', KEYS[1], priority * 4294967296 + (tonumber(id) % 4294967296), id)
  end
end
"#;

/// Pops the next job into `active` unless the queue is paused, leased for
/// the job's `lease_ms`.
const CLAIM_NEXT: &str = r#"
if redis.call('EXISTS', KEYS[4]) == 1 then
  return false
end
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return false
end
local id = popped[1]
local key = ARGV[2] .. id
local lease = tonumber(redis.call('HGET', key, 'lease_ms') or ARGV[4]) or tonumber(ARGV[4])
redis.call('HSET', key, 'state', 'active')
redis.call('ZADD', KEYS[3], tonumber(ARGV[1]) + lease, id)
return id
"#;

/// Moves an active job into a terminal ring, trimming it to `retain`.
/// KEYS: active, ring. ARGV: job_key_prefix, id, state, finished_ms, field, value, retain.
const FINISH: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[2]) == 0 then
  return 0
end
local key = ARGV[1] .. ARGV[2]
redis.call('HSET', key, 'state', ARGV[3], 'finished_at', ARGV[4], ARGV[5], ARGV[6])
redis.call('HINCRBY', key, 'attempts', 1)
redis.call('ZADD', KEYS[2], ARGV[4], ARGV[2])
local excess = redis.call('ZCARD', KEYS[2]) - tonumber(ARGV[7])
if excess > 0 then
  local evicted = redis.call('ZRANGE', KEYS[2], 0, excess - 1)
  for _, old in ipairs(evicted) do
    redis.call('DEL', ARGV[1] .. old)
  end
  redis.call('ZREMRANGEBYRANK', KEYS[2], 0, excess - 1)
end
return 1
"#;

/// Moves an active job to `delayed` after a failed attempt.
/// KEYS: active, delayed. ARGV: job_key_prefix, id, ready_ms, reason.
const RETRY: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[2]) == 0 then
  return 0
end
local key = ARGV[1] .. ARGV[2]
redis.call('HSET', key, 'state', 'delayed', 'reason', ARGV[4])
redis.call('HINCRBY', key, 'attempts', 1)
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
return 1
"#;

/// Deletes ring members finished at or before the cutoff.
/// KEYS: ring. ARGV: job_key_prefix, cutoff_ms.
const CLEAN: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
for _, id in ipairs(ids) do
  redis.call('DEL', ARGV[1] .. id)
  redis.call('ZREM', KEYS[1], id)
end
return ids
"#;

pub struct Scripts {
    /// Stalled recovery then promotion, without claiming.
    pub maintain: Script,
    pub claim: Script,
    pub finish: Script,
    pub retry: Script,
    pub clean: Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            maintain: Script::new(&format!("{}{}", RECOVER_STALLED, PROMOTE_DUE)),
            claim: Script::new(&format!("{}{}{}", RECOVER_STALLED, PROMOTE_DUE, CLAIM_NEXT)),
            finish: Script::new(FINISH),
            retry: Script::new(RETRY),
            clean: Script::new(CLEAN),
        }
    }
}

impl Default for Scripts {
    fn default() -> Self {
        Self::new()
    }
}

/// Score of a job in `wait`; must agree with the Lua in `PROMOTE_DUE`.
pub fn wait_score(priority: Option<u32>, id: u64) -> f64 {
    priority.unwrap_or(0) as f64 * 4_294_967_296.0 + (id % 4_294_967_296) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_dominates_insertion_order() {
        assert!(wait_score(Some(1), 10) < wait_score(Some(2), 1));
        assert!(wait_score(None, 1) < wait_score(None, 2));
        assert!(wait_score(None, 99) < wait_score(Some(1), 1));
    }

    #[test]
    fn test_claim_script_recovers_and_promotes_before_popping() {
        let claim = format!("{}{}{}", RECOVER_STALLED, PROMOTE_DUE, CLAIM_NEXT);
        let recover_at = claim.find("KEYS[3], '-inf'").unwrap();
        let promote_at = claim.find("KEYS[2], '-inf'").unwrap();
        let pop_at = claim.find("ZPOPMIN").unwrap();
        assert!(recover_at < promote_at);
        assert!(promote_at < pop_at);
    }

    #[test]
    fn test_active_is_a_lease_zset() {
        for script in [CLAIM_NEXT, FINISH, RETRY] {
            assert!(!script.contains("SADD") && !script.contains("SREM"));
        }
        assert!(RECOVER_STALLED.contains("HINCRBY"));
    }
}
