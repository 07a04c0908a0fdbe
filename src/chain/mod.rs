//! On-chain read surface used by the crawler.
//!
//! The crawler only ever needs two things from a node: a read-only call decoded against an
//! ABI, and a raw storage-slot read. Everything else (providers, retries, rate limits) stays
//! behind [`ChainReader`] so tests can swap in an in-memory chain.

pub mod retry;
pub mod rpc;

use alloy::dyn_abi::{DynSolValue, FunctionExt, JsonAbiExt};
use alloy::json_abi::{Function, JsonAbi};
use alloy::primitives::{Address, B256};
use async_trait::async_trait;

use crate::error::{Result, SpiderError};

#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Execute a read-only call of `function` on `address` and decode its outputs with `abi`.
    async fn call(
        &self,
        address: Address,
        abi: &JsonAbi,
        function: &str,
        args: &[DynSolValue],
    ) -> Result<Vec<DynSolValue>>;

    /// Read one 32-byte storage word, bypassing the ABI entirely.
    async fn read_storage_slot(&self, address: Address, slot: B256) -> Result<B256>;
}

/// Pick the overload of `name` taking exactly `arity` inputs.
pub fn find_function<'a>(abi: &'a JsonAbi, name: &str, arity: usize) -> Option<&'a Function> {
    abi.function(name)?
        .iter()
        .find(|candidate| candidate.inputs.len() == arity)
}

pub fn encode_call(function: &Function, args: &[DynSolValue]) -> Result<Vec<u8>> {
    function
        .abi_encode_input(args)
        .map_err(|err| SpiderError::Decode(format!("encode {}: {err}", function.signature())))
}

pub fn decode_output(function: &Function, data: &[u8]) -> Result<Vec<DynSolValue>> {
    function
        .abi_decode_output(data, true)
        .map_err(|err| SpiderError::Decode(format!("decode {}: {err}", function.signature())))
}

/// Collect every address in a decoded return value, descending into arrays and tuples.
/// Order follows the encoding order.
pub fn collect_addresses(values: &[DynSolValue]) -> Vec<Address> {
    let mut out = Vec::new();
    for value in values {
        push_addresses(value, &mut out);
    }
    out
}

fn push_addresses(value: &DynSolValue, out: &mut Vec<Address>) {
    match value {
        DynSolValue::Address(address) => out.push(*address),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            for item in items {
                push_addresses(item, out);
            }
        }
        _ => {}
    }
}

/// Select a named output field of `function` from its decoded outputs. A single tuple
/// output is unwrapped first so struct-returning getters can be addressed by member name.
pub fn select_field(
    function: &Function,
    values: Vec<DynSolValue>,
    field: &str,
) -> Option<DynSolValue> {
    if let Some(idx) = function.outputs.iter().position(|param| param.name == field) {
        return values.into_iter().nth(idx);
    }
    let [single] = function.outputs.as_slice() else {
        return None;
    };
    let idx = single
        .components
        .iter()
        .position(|param| param.name == field)?;
    match values.into_iter().next()? {
        DynSolValue::Tuple(items) => items.into_iter().nth(idx),
        _ => None,
    }
}

/// Render a decoded value as display text, used for alias resolution.
pub fn value_to_text(value: &DynSolValue) -> Option<String> {
    match value {
        DynSolValue::String(text) => Some(text.clone()),
        DynSolValue::Address(address) => Some(format!("{address:#x}")),
        DynSolValue::Uint(value, _) => Some(value.to_string()),
        DynSolValue::Int(value, _) => Some(value.to_string()),
        DynSolValue::Bool(flag) => Some(flag.to_string()),
        DynSolValue::FixedBytes(word, size) => {
            // bytes32 symbols (e.g. MKR) are right-padded ASCII.
            let raw = &word.as_slice()[..*size];
            let trimmed: Vec<u8> = raw.iter().copied().take_while(|b| *b != 0).collect();
            String::from_utf8(trimmed)
                .ok()
                .filter(|text| !text.is_empty())
                .or_else(|| Some(format!("0x{}", hex::encode(raw))))
        }
        _ => None,
    }
}
