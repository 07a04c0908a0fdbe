use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, U256};
use futures::future::BoxFuture;
use futures::FutureExt;

use super::contract_map::ContractHandle;
use super::proxy::read_slot_address;
use crate::chain::{collect_addresses, find_function, select_field, ChainReader};
use crate::error::{Result, SpiderError};
use crate::relations::ResolutionStrategy;

/// Upper bound on `count()` for indexed relations.
pub const MAX_INDEXED_ITEMS: usize = 256;

/// Addresses produced by one relation, in resolver order. Zero addresses are kept so
/// positional names stay stable; the crawler prunes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRelation {
    pub addresses: Vec<Address>,
    /// True when the resolver yields a collection, whose children are named `{name}:{index}`.
    pub collection: bool,
}

impl ResolvedRelation {
    fn single(address: Address) -> Self {
        Self {
            addresses: vec![address],
            collection: false,
        }
    }

    /// Default child names, parallel to `addresses`.
    pub fn child_names(&self, relation: &str) -> Vec<String> {
        if self.collection {
            (0..self.addresses.len())
                .map(|idx| format!("{relation}:{idx}"))
                .collect()
        } else {
            vec![relation.to_string(); self.addresses.len()]
        }
    }
}

pub fn resolve_relation<'a>(
    reader: &'a dyn ChainReader,
    contract: &'a ContractHandle,
    strategy: &'a ResolutionStrategy,
) -> BoxFuture<'a, Result<ResolvedRelation>> {
    async move {
        match strategy {
            ResolutionStrategy::Const(address) => Ok(ResolvedRelation::single(*address)),
            ResolutionStrategy::Slot(slot) => Ok(ResolvedRelation::single(
                read_slot_address(reader, contract.address, *slot).await?,
            )),
            ResolutionStrategy::Call(function) => {
                let values = contract.call(reader, function, &[]).await?;
                let collection = !matches!(values.as_slice(), [DynSolValue::Address(_)]);
                Ok(ResolvedRelation {
                    addresses: collect_addresses(&values),
                    collection,
                })
            }
            ResolutionStrategy::Indexed { count, item, field } => {
                let addresses =
                    resolve_indexed(reader, contract, count, item, field.as_deref()).await?;
                Ok(ResolvedRelation {
                    addresses,
                    collection: true,
                })
            }
            ResolutionStrategy::List(items) => {
                let mut addresses = Vec::new();
                for item in items {
                    addresses.extend(resolve_relation(reader, contract, item).await?.addresses);
                }
                Ok(ResolvedRelation {
                    addresses,
                    collection: true,
                })
            }
        }
    }
    .boxed()
}

async fn resolve_indexed(
    reader: &dyn ChainReader,
    contract: &ContractHandle,
    count_fn: &str,
    item_fn: &str,
    field: Option<&str>,
) -> Result<Vec<Address>> {
    let counted = contract.call(reader, count_fn, &[]).await?;
    let total = match counted.first() {
        Some(DynSolValue::Uint(value, _)) => usize::try_from(*value).unwrap_or(usize::MAX),
        _ => {
            return Err(SpiderError::Decode(format!(
                "{}.{}() on {:#x} did not return an integer",
                contract.name, count_fn, contract.address
            )))
        }
    };
    if total > MAX_INDEXED_ITEMS {
        return Err(SpiderError::InvalidConfig(format!(
            "{}.{}() returned {} items, limit is {}",
            contract.name, count_fn, total, MAX_INDEXED_ITEMS
        )));
    }

    let missing = || SpiderError::MissingRelationFunction {
        contract: contract.name.clone(),
        address: contract.address,
        function: item_fn.to_string(),
    };
    let function = find_function(&contract.abi, item_fn, 1).ok_or_else(missing)?;
    let bits = index_bits(&function.inputs[0].ty).ok_or_else(|| {
        SpiderError::InvalidConfig(format!(
            "{}.{} must take one unsigned index, takes {}",
            contract.name, item_fn, function.inputs[0].ty
        ))
    })?;

    let mut out = Vec::with_capacity(total);
    for idx in 0..total {
        let args = [DynSolValue::Uint(U256::from(idx), bits)];
        let values = contract.call(reader, item_fn, &args).await?;
        let selected = match field {
            Some(name) => {
                let value = select_field(function, values, name).ok_or_else(|| {
                    SpiderError::Decode(format!(
                        "{}.{}({}) has no output field `{}`",
                        contract.name, item_fn, idx, name
                    ))
                })?;
                collect_addresses(&[value])
            }
            None => collect_addresses(&values),
        };
        out.extend(selected);
    }
    Ok(out)
}

fn index_bits(ty: &str) -> Option<usize> {
    let width = ty.strip_prefix("uint")?;
    if width.is_empty() {
        return Some(256);
    }
    width
        .parse::<usize>()
        .ok()
        .filter(|bits| *bits % 8 == 0 && (8..=256).contains(bits))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_bits_accepts_unsigned_only() {
        assert_eq!(index_bits("uint8"), Some(8));
        assert_eq!(index_bits("uint"), Some(256));
        assert_eq!(index_bits("int8"), None);
        assert_eq!(index_bits("uint7"), None);
        assert_eq!(index_bits("address"), None);
    }

    #[test]
    fn test_child_names_are_positional_for_collections() {
        let many = ResolvedRelation {
            addresses: vec![Address::ZERO, Address::ZERO],
            collection: true,
        };
        assert_eq!(many.child_names("assets"), vec!["assets:0", "assets:1"]);
        let one = ResolvedRelation::single(Address::ZERO);
        assert_eq!(one.child_names("governor"), vec!["governor"]);
    }
}
