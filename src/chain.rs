//! JSON-RPC 2.0 queries over the provider proxy.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};

use crate::error::LinkError;
use crate::provider::ProviderProxy;

/// Chain queries issued through a [`ProviderProxy`].
pub struct ChainQuery {
    provider: Arc<ProviderProxy>,
    next_id: AtomicU64,
}

impl ChainQuery {
    #[must_use]
    pub fn new(provider: Arc<ProviderProxy>) -> Self {
        Self { provider, next_id: AtomicU64::new(1) }
    }

    /// Send a JSON-RPC 2.0 request and return its `result`.
    ///
    /// # Errors
    ///
    /// - [`LinkError::RemoteError`] if the reply carries an `error` object.
    /// - [`LinkError::Decode`] if the reply is not a JSON-RPC response.
    /// - Any error the provider request settles with.
    pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, LinkError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let payload = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let reply = self.provider.request(payload).await?;
        into_result(method, reply)
    }

    /// # Errors
    ///
    /// See [`ChainQuery::request`]; also [`LinkError::Decode`] for a bad quantity.
    pub async fn block_number(&self) -> Result<u64, LinkError> {
        let value = self.request("eth_blockNumber", vec![]).await?;
        narrow(parse_quantity(&value)?)
    }

    /// # Errors
    ///
    /// See [`ChainQuery::block_number`].
    pub async fn chain_id(&self) -> Result<u64, LinkError> {
        let value = self.request("eth_chainId", vec![]).await?;
        narrow(parse_quantity(&value)?)
    }

    /// Balance of `address` in wei at `block` (`"latest"`, `"pending"` or a hex
    /// block number).
    ///
    /// # Errors
    ///
    /// See [`ChainQuery::block_number`].
    pub async fn get_balance(&self, address: &str, block: &str) -> Result<u128, LinkError> {
        let value = self.request("eth_getBalance", vec![json!(address), json!(block)]).await?;
        parse_quantity(&value)
    }

    /// # Errors
    ///
    /// See [`ChainQuery::block_number`].
    pub async fn get_transaction_count(&self, address: &str, block: &str) -> Result<u64, LinkError> {
        let value = self.request("eth_getTransactionCount", vec![json!(address), json!(block)]).await?;
        narrow(parse_quantity(&value)?)
    }

    #[must_use]
    pub fn provider(&self) -> &ProviderProxy {
        &self.provider
    }
}

fn into_result(method: &str, reply: Value) -> Result<Value, LinkError> {
    let Value::Object(mut reply) = reply else {
        return Err(LinkError::Decode(format!("{method}: reply is not an object")));
    };
    if let Some(error) = reply.remove("error").filter(|error| !error.is_null()) {
        return Err(LinkError::from_fault(frames::RemoteFault::from_value(&error)));
    }
    Ok(reply.remove("result").unwrap_or(Value::Null))
}

/// Parse a hex quantity such as `"0x1a"`.
///
/// # Errors
///
/// Returns [`LinkError::Decode`] unless `value` is a `0x`-prefixed hex string
/// that fits in 128 bits.
pub fn parse_quantity(value: &Value) -> Result<u128, LinkError> {
    let text = value.as_str().ok_or_else(|| LinkError::Decode(format!("expected hex quantity, got {value}")))?;
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .ok_or_else(|| LinkError::Decode(format!("quantity missing 0x prefix: {text}")))?;
    if digits.is_empty() {
        return Err(LinkError::Decode("empty quantity".into()));
    }
    u128::from_str_radix(digits, 16).map_err(|error| LinkError::Decode(format!("bad quantity {text}: {error}")))
}

fn narrow(quantity: u128) -> Result<u64, LinkError> {
    u64::try_from(quantity).map_err(|_| LinkError::Decode(format!("quantity out of range: {quantity}")))
}

#[cfg(test)]
#[path = "chain_test.rs"]
mod tests;
