//! Redis-backed budget engine.
//!
//! Every mutation is one Lua script (EVALSHA via [`redis::Script`]), which is
//! what makes the engine's operations atomic: Redis runs scripts serially,
//! so concurrent reserve/settle calls on the same tenant interleave at
//! whole-operation granularity only.
//!
//! Key layout (the only keys in this namespace):
//! - `budget:{tenant_id}:balance_micros` - balance as a decimal string
//! - `reserve:{tenant_id}:{run_id}` - hash `amount_micros`, `created_at_ms`,
//!   with TTL `T_res`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;

use packflow_core::{Money, RunId, TenantId};

use crate::engine::{BudgetEngine, BudgetError, Reservation, ReserveReceipt, Settlement};

/// Atomically reserve budget.
///
/// Re-reserving the same amount is a no-op; a different amount is a
/// duplicate. The soft limit bounds how far the balance may go negative.
const RESERVE_LUA: &str = r#"
local budget_key = KEYS[1]
local reserve_key = KEYS[2]
local amount = tonumber(ARGV[1])
local soft_limit = tonumber(ARGV[2])
local created_at_ms = ARGV[3]
local ttl_secs = tonumber(ARGV[4])

local existing = redis.call("HGET", reserve_key, "amount_micros")
if existing then
  if tonumber(existing) == amount then
    local bal = tonumber(redis.call("GET", budget_key) or "0")
    return {"OK", tostring(bal)}
  end
  return {"ERR_DUPLICATE"}
end

local bal = tonumber(redis.call("GET", budget_key) or "0")
if bal - amount < soft_limit then
  return {"ERR_INSUFFICIENT", tostring(bal)}
end

redis.call("SET", budget_key, tostring(bal - amount))
redis.call("HSET", reserve_key,
  "amount_micros", tostring(amount),
  "created_at_ms", created_at_ms
)
redis.call("EXPIRE", reserve_key, ttl_secs)
return {"OK", tostring(bal - amount)}
"#;

/// Atomically settle a reservation.
///
/// Clamps the charge into `[0, reserved]` so a buggy or hostile caller can
/// neither overcharge nor produce a negative charge, credits the refund,
/// and deletes the reservation. The missing-reservation error is the race
/// witness the finalize protocol depends on.
const SETTLE_LUA: &str = r#"
local budget_key = KEYS[1]
local reserve_key = KEYS[2]
local charge = tonumber(ARGV[1])

if redis.call("EXISTS", reserve_key) ~= 1 then
  return {"ERR_NO_RESERVE"}
end

local reserved = tonumber(redis.call("HGET", reserve_key, "amount_micros") or "0")

if charge < 0 then
  charge = 0
end
if charge > reserved then
  charge = reserved
end

local refund = reserved - charge
local bal = tonumber(redis.call("GET", budget_key) or "0")
bal = bal + refund

redis.call("SET", budget_key, tostring(bal))
redis.call("DEL", reserve_key)
return {"OK", tostring(charge), tostring(refund), tostring(bal)}
"#;

/// Budget engine executing atomic Lua scripts against Redis.
#[derive(Clone)]
pub struct RedisBudgetEngine {
    client: Arc<redis::Client>,
    reserve_script: Script,
    settle_script: Script,
    reservation_ttl_secs: u64,
}

impl RedisBudgetEngine {
    /// Connect to Redis at `redis_url` (e.g. `"redis://localhost:6379"`).
    pub fn new(redis_url: impl AsRef<str>, reservation_ttl: Duration) -> Result<Self, BudgetError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BudgetError::Storage(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            reserve_script: Script::new(RESERVE_LUA),
            settle_script: Script::new(SETTLE_LUA),
            reservation_ttl_secs: reservation_ttl.as_secs().max(1),
        })
    }

    fn budget_key(tenant_id: TenantId) -> String {
        format!("budget:{tenant_id}:balance_micros")
    }

    fn reserve_key(tenant_id: TenantId, run_id: RunId) -> String {
        format!("reserve:{tenant_id}:{run_id}")
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, BudgetError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BudgetError::Storage(e.to_string()))
    }

    fn parse_micros(raw: &str) -> Result<Money, BudgetError> {
        raw.parse::<i64>()
            .map(Money::from_micros)
            .map_err(|e| BudgetError::Storage(format!("bad ledger integer '{raw}': {e}")))
    }
}

#[async_trait]
impl BudgetEngine for RedisBudgetEngine {
    async fn reserve(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        amount: Money,
        soft_limit: Money,
    ) -> Result<ReserveReceipt, BudgetError> {
        let mut conn = self.connection().await?;

        let reply: Vec<String> = self
            .reserve_script
            .key(Self::budget_key(tenant_id))
            .key(Self::reserve_key(tenant_id, run_id))
            .arg(amount.as_micros())
            .arg(soft_limit.as_micros())
            .arg(Utc::now().timestamp_millis())
            .arg(self.reservation_ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BudgetError::Storage(e.to_string()))?;

        match reply.first().map(String::as_str) {
            Some("OK") => {
                let balance = reply
                    .get(1)
                    .ok_or_else(|| BudgetError::Storage("reserve reply missing balance".to_string()))?;
                Ok(ReserveReceipt {
                    new_balance: Self::parse_micros(balance)?,
                })
            }
            Some("ERR_INSUFFICIENT") => {
                let available = reply
                    .get(1)
                    .map(|s| Self::parse_micros(s))
                    .transpose()?
                    .unwrap_or(Money::ZERO);
                Err(BudgetError::Insufficient {
                    requested: amount,
                    available,
                })
            }
            Some("ERR_DUPLICATE") => Err(BudgetError::DuplicateReservation),
            other => Err(BudgetError::Storage(format!(
                "unexpected reserve reply: {other:?}"
            ))),
        }
    }

    async fn settle(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        actual: Money,
    ) -> Result<Settlement, BudgetError> {
        let mut conn = self.connection().await?;

        let reply: Vec<String> = self
            .settle_script
            .key(Self::budget_key(tenant_id))
            .key(Self::reserve_key(tenant_id, run_id))
            .arg(actual.as_micros())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BudgetError::Storage(e.to_string()))?;

        match reply.first().map(String::as_str) {
            Some("OK") => {
                if reply.len() < 4 {
                    return Err(BudgetError::Storage(format!(
                        "short settle reply: {reply:?}"
                    )));
                }
                Ok(Settlement {
                    charge: Self::parse_micros(&reply[1])?,
                    refund: Self::parse_micros(&reply[2])?,
                    new_balance: Self::parse_micros(&reply[3])?,
                })
            }
            Some("ERR_NO_RESERVE") => Err(BudgetError::NoReservation),
            other => Err(BudgetError::Storage(format!(
                "unexpected settle reply: {other:?}"
            ))),
        }
    }

    async fn get_reservation(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
    ) -> Result<Option<Reservation>, BudgetError> {
        let mut conn = self.connection().await?;

        let fields: std::collections::HashMap<String, String> = redis::cmd("HGETALL")
            .arg(Self::reserve_key(tenant_id, run_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| BudgetError::Storage(e.to_string()))?;

        if fields.is_empty() {
            return Ok(None);
        }

        let amount = fields
            .get("amount_micros")
            .ok_or_else(|| BudgetError::Storage("reservation missing amount_micros".to_string()))?;
        let created_at_ms: i64 = fields
            .get("created_at_ms")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        Ok(Some(Reservation {
            tenant_id,
            run_id,
            amount: Self::parse_micros(amount)?,
            created_at: DateTime::<Utc>::from_timestamp_millis(created_at_ms)
                .unwrap_or_else(Utc::now),
        }))
    }

    async fn balance(&self, tenant_id: TenantId) -> Result<Money, BudgetError> {
        let mut conn = self.connection().await?;

        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::budget_key(tenant_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| BudgetError::Storage(e.to_string()))?;

        match raw {
            Some(s) => Self::parse_micros(&s),
            None => Ok(Money::ZERO),
        }
    }

    async fn set_balance(&self, tenant_id: TenantId, amount: Money) -> Result<(), BudgetError> {
        let mut conn = self.connection().await?;

        let _: () = redis::cmd("SET")
            .arg(Self::budget_key(tenant_id))
            .arg(amount.as_micros())
            .query_async(&mut conn)
            .await
            .map_err(|e| BudgetError::Storage(e.to_string()))?;

        Ok(())
    }
}
