//! Declarative resolution strategies.
//!
//! Every strategy round-trips through a compact string form (`call:implementation`,
//! `slot:0x3608…`, `const:0xabc…`, `indexed:numAssets:getAssetInfo:asset`) so relation
//! tables stay plain JSON that can be diffed and audited.

use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SpiderError;
use crate::utils::constants::{
    EIP1822_PROXIABLE_SLOT, EIP1967_ADMIN_SLOT, EIP1967_BEACON_SLOT, EIP1967_IMPL_SLOT,
};
use crate::utils::hex::{parse_address, parse_slot};

/// How to find a proxy's implementation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ProxyStrategy {
    /// Zero-argument view returning the implementation (`implementation()`, `extensionDelegate()`).
    Call(String),
    /// Raw storage word holding the implementation in its low 20 bytes.
    Slot(B256),
    /// Statically configured implementation.
    Const(Address),
}

/// How to find one or more child addresses from a parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawResolver", into = "RawResolver")]
pub enum ResolutionStrategy {
    /// Zero-argument view returning an address, an address array, or a struct of addresses.
    Call(String),
    Slot(B256),
    Const(Address),
    /// `count()` followed by `item(i)` for every `i < count`, optionally selecting a field
    /// of a struct return value.
    Indexed {
        count: String,
        item: String,
        field: Option<String>,
    },
    /// Concatenation of several resolvers, in order.
    List(Vec<ResolutionStrategy>),
}

/// How to name a discovered contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AliasResolver {
    /// Zero-argument view whose result is the alias (`symbol()`).
    Call(String),
    /// Literal alias.
    Const(String),
    /// Text with `{fn}` placeholders, each replaced by the result of `fn()`.
    Template(String),
}

fn split_tag(raw: &str) -> Result<(&str, &str), SpiderError> {
    let trimmed = raw.trim();
    trimmed
        .split_once(':')
        .map(|(tag, rest)| (tag.trim(), rest.trim()))
        .filter(|(_, rest)| !rest.is_empty())
        .ok_or_else(|| {
            SpiderError::InvalidConfig(format!("resolver `{raw}` must look like `<kind>:<value>`"))
        })
}

/// Well-known slot names, or raw hex.
fn slot(raw: &str) -> Result<B256, SpiderError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "eip1967" | "eip1967.implementation" => Ok(EIP1967_IMPL_SLOT),
        "eip1967.admin" => Ok(EIP1967_ADMIN_SLOT),
        "eip1967.beacon" => Ok(EIP1967_BEACON_SLOT),
        "eip1822" | "eip1822.proxiable" => Ok(EIP1822_PROXIABLE_SLOT),
        _ => parse_slot(raw),
    }
}

fn function_name(raw: &str) -> Result<String, SpiderError> {
    let name = raw.trim().trim_end_matches("()");
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(name.to_string())
    } else {
        Err(SpiderError::InvalidConfig(format!(
            "`{raw}` is not a valid function name"
        )))
    }
}

impl FromStr for ProxyStrategy {
    type Err = SpiderError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match split_tag(raw)? {
            ("call", name) => Ok(Self::Call(function_name(name)?)),
            ("slot", raw_slot) => Ok(Self::Slot(slot(raw_slot)?)),
            ("const", address) => Ok(Self::Const(parse_address(address)?)),
            (other, _) => Err(SpiderError::InvalidConfig(format!(
                "unknown proxy strategy `{other}` in `{raw}`"
            ))),
        }
    }
}

impl fmt::Display for ProxyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(name) => write!(f, "call:{name}"),
            Self::Slot(slot) => write!(f, "slot:{slot}"),
            Self::Const(address) => write!(f, "const:{address:#x}"),
        }
    }
}

impl TryFrom<String> for ProxyStrategy {
    type Error = SpiderError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<ProxyStrategy> for String {
    fn from(strategy: ProxyStrategy) -> Self {
        strategy.to_string()
    }
}

impl FromStr for ResolutionStrategy {
    type Err = SpiderError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match split_tag(raw)? {
            ("call", name) => Ok(Self::Call(function_name(name)?)),
            ("slot", raw_slot) => Ok(Self::Slot(slot(raw_slot)?)),
            ("const", address) => Ok(Self::Const(parse_address(address)?)),
            ("indexed", body) => {
                let parts: Vec<&str> = body.split(':').map(str::trim).collect();
                match parts.as_slice() {
                    [count, item] => Ok(Self::Indexed {
                        count: function_name(count)?,
                        item: function_name(item)?,
                        field: None,
                    }),
                    [count, item, field] => Ok(Self::Indexed {
                        count: function_name(count)?,
                        item: function_name(item)?,
                        field: Some(function_name(field)?),
                    }),
                    _ => Err(SpiderError::InvalidConfig(format!(
                        "indexed resolver `{raw}` must be `indexed:<countFn>:<itemFn>[:<field>]`"
                    ))),
                }
            }
            (other, _) => Err(SpiderError::InvalidConfig(format!(
                "unknown resolver `{other}` in `{raw}`"
            ))),
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(name) => write!(f, "call:{name}"),
            Self::Slot(slot) => write!(f, "slot:{slot}"),
            Self::Const(address) => write!(f, "const:{address:#x}"),
            Self::Indexed { count, item, field } => match field {
                Some(field) => write!(f, "indexed:{count}:{item}:{field}"),
                None => write!(f, "indexed:{count}:{item}"),
            },
            Self::List(items) => {
                let rendered: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", rendered.join(", "))
            }
        }
    }
}

/// JSON shape of a resolver: one strategy string, or an array of resolvers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawResolver {
    One(String),
    Many(Vec<RawResolver>),
}

impl TryFrom<RawResolver> for ResolutionStrategy {
    type Error = SpiderError;

    fn try_from(raw: RawResolver) -> Result<Self, Self::Error> {
        match raw {
            RawResolver::One(text) => text.parse(),
            RawResolver::Many(items) => Ok(Self::List(
                items
                    .into_iter()
                    .map(ResolutionStrategy::try_from)
                    .collect::<Result<_, _>>()?,
            )),
        }
    }
}

impl From<ResolutionStrategy> for RawResolver {
    fn from(strategy: ResolutionStrategy) -> Self {
        match strategy {
            ResolutionStrategy::List(items) => {
                RawResolver::Many(items.into_iter().map(RawResolver::from).collect())
            }
            other => RawResolver::One(other.to_string()),
        }
    }
}

impl FromStr for AliasResolver {
    type Err = SpiderError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match split_tag(raw)? {
            ("call", name) => Ok(Self::Call(function_name(name)?)),
            ("const", literal) => Ok(Self::Const(literal.to_string())),
            ("template", text) => {
                let placeholders = template_placeholders(text)?;
                for name in &placeholders {
                    function_name(name)?;
                }
                Ok(Self::Template(text.to_string()))
            }
            (other, _) => Err(SpiderError::InvalidConfig(format!(
                "unknown alias resolver `{other}` in `{raw}`"
            ))),
        }
    }
}

impl fmt::Display for AliasResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(name) => write!(f, "call:{name}"),
            Self::Const(literal) => write!(f, "const:{literal}"),
            Self::Template(text) => write!(f, "template:{text}"),
        }
    }
}

impl TryFrom<String> for AliasResolver {
    type Error = SpiderError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<AliasResolver> for String {
    fn from(resolver: AliasResolver) -> Self {
        resolver.to_string()
    }
}

/// Names inside `{...}` in template order. Unbalanced braces are a config error.
pub fn template_placeholders(text: &str) -> Result<Vec<String>, SpiderError> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            SpiderError::InvalidConfig(format!("unbalanced `{{` in alias template `{text}`"))
        })?;
        out.push(after[..close].trim().to_string());
        rest = &after[close + 1..];
    }
    if rest.contains('}') {
        return Err(SpiderError::InvalidConfig(format!(
            "unbalanced `}}` in alias template `{text}`"
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_strategy_parses_each_kind() {
        assert_eq!(
            "call:implementation()".parse::<ProxyStrategy>().ok(),
            Some(ProxyStrategy::Call("implementation".into()))
        );
        assert_eq!(
            "slot:0x360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc"
                .parse::<ProxyStrategy>()
                .ok(),
            Some(ProxyStrategy::Slot(EIP1967_IMPL_SLOT))
        );
        assert_eq!(
            "slot:eip1967".parse::<ProxyStrategy>().ok(),
            Some(ProxyStrategy::Slot(EIP1967_IMPL_SLOT))
        );
        assert_eq!(
            "slot:eip1967.admin".parse::<ResolutionStrategy>().ok(),
            Some(ResolutionStrategy::Slot(EIP1967_ADMIN_SLOT))
        );
        assert!(matches!(
            "const:0x25ace71c97b33cc4729cf772ae268934f7ab5fa1".parse::<ProxyStrategy>(),
            Ok(ProxyStrategy::Const(_))
        ));
        assert!("indexed:a:b".parse::<ProxyStrategy>().is_err());
        assert!("implementation".parse::<ProxyStrategy>().is_err());
    }

    #[test]
    fn test_resolver_json_accepts_strings_and_lists() {
        let parsed: ResolutionStrategy = serde_json::from_str(
            r#"["call:governor", "indexed:numAssets:getAssetInfo:asset"]"#,
        )
        .expect("list");
        assert_eq!(
            parsed,
            ResolutionStrategy::List(vec![
                ResolutionStrategy::Call("governor".into()),
                ResolutionStrategy::Indexed {
                    count: "numAssets".into(),
                    item: "getAssetInfo".into(),
                    field: Some("asset".into()),
                },
            ])
        );
        let rendered = serde_json::to_string(&parsed).expect("serialize");
        assert_eq!(
            rendered,
            r#"["call:governor","indexed:numAssets:getAssetInfo:asset"]"#
        );
    }

    #[test]
    fn test_alias_template_validates_placeholders() {
        assert_eq!(
            "template:{symbol}:priceFeed".parse::<AliasResolver>().ok(),
            Some(AliasResolver::Template("{symbol}:priceFeed".into()))
        );
        assert!("template:{symbol:priceFeed".parse::<AliasResolver>().is_err());
        assert!("template:{1bad}".parse::<AliasResolver>().is_err());
        assert_eq!(
            template_placeholders("{symbol}-{decimals}").ok(),
            Some(vec!["symbol".to_string(), "decimals".to_string()])
        );
    }
}
