use super::contract_map::ContractHandle;
use crate::chain::{value_to_text, ChainReader};
use crate::error::{Result, SpiderError};
use crate::relations::strategy::template_placeholders;
use crate::relations::AliasResolver;

/// Display name for a node. The first resolver present wins; with none, `default_name`
/// is kept. An alias that resolves to blank text also falls back to `default_name`.
pub async fn assign_name(
    reader: &dyn ChainReader,
    default_name: &str,
    resolvers: &[Option<&AliasResolver>],
    contract: &ContractHandle,
) -> Result<String> {
    let Some(resolver) = resolvers.iter().copied().flatten().next() else {
        return Ok(default_name.to_string());
    };

    let alias = match resolver {
        AliasResolver::Const(literal) => literal.clone(),
        AliasResolver::Call(function) => call_text(reader, contract, function).await?,
        AliasResolver::Template(template) => render_template(reader, contract, template).await?,
    };

    let alias = alias.trim();
    if alias.is_empty() {
        tracing::debug!(
            "[SPIDER] alias {} for {:#x} is blank, keeping {}",
            resolver,
            contract.address,
            default_name
        );
        return Ok(default_name.to_string());
    }
    Ok(alias.to_string())
}

/// Fills each `{function}` placeholder in one left-to-right pass over the template, so
/// braces inside a returned value are never reinterpreted.
async fn render_template(
    reader: &dyn ChainReader,
    contract: &ContractHandle,
    template: &str,
) -> Result<String> {
    template_placeholders(template)?;
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            break;
        };
        let function = after[..close].trim().trim_end_matches("()");
        rendered.push_str(&call_text(reader, contract, function).await?);
        rest = &after[close + 1..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}

async fn call_text(
    reader: &dyn ChainReader,
    contract: &ContractHandle,
    function: &str,
) -> Result<String> {
    let values = contract.call(reader, function, &[]).await?;
    values.first().and_then(value_to_text).ok_or_else(|| {
        SpiderError::Decode(format!(
            "{}.{}() on {:#x} returned nothing printable",
            contract.name, function, contract.address
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::dyn_abi::DynSolValue;
    use alloy::json_abi::JsonAbi;
    use alloy::primitives::{Address, B256};
    use std::sync::Arc;

    /// Answers every call with the function's canned text.
    struct TextReader(Vec<(&'static str, &'static str)>);

    #[async_trait::async_trait]
    impl ChainReader for TextReader {
        async fn call(
            &self,
            address: Address,
            _abi: &JsonAbi,
            function: &str,
            _args: &[DynSolValue],
        ) -> Result<Vec<DynSolValue>> {
            self.0
                .iter()
                .find(|(name, _)| *name == function)
                .map(|(_, text)| vec![DynSolValue::String(text.to_string())])
                .ok_or_else(|| SpiderError::CallFailed {
                    address,
                    function: function.to_string(),
                    reason: "execution reverted".into(),
                })
        }

        async fn read_storage_slot(&self, _address: Address, _slot: B256) -> Result<B256> {
            Ok(B256::ZERO)
        }
    }

    fn token() -> ContractHandle {
        let abi: JsonAbi = serde_json::from_value(serde_json::json!([
            {"type":"function","name":"symbol","stateMutability":"view","inputs":[],
             "outputs":[{"name":"","type":"string"}]},
            {"type":"function","name":"name","stateMutability":"view","inputs":[],
             "outputs":[{"name":"","type":"string"}]}
        ]))
        .expect("abi");
        ContractHandle::new("token", Address::from([0x0a; 20]), Arc::new(abi))
    }

    #[tokio::test]
    async fn test_template_fills_each_placeholder_once() {
        let reader = TextReader(vec![("symbol", "USDC"), ("name", "USD Coin")]);
        let resolver = AliasResolver::Template("c{symbol}v3 ({ name() })".into());
        let name = assign_name(&reader, "fallback", &[Some(&resolver)], &token())
            .await
            .expect("alias");
        assert_eq!(name, "cUSDCv3 (USD Coin)");
    }

    #[tokio::test]
    async fn test_braces_in_returned_text_are_not_expanded() {
        let reader = TextReader(vec![("symbol", "{name}"), ("name", "X")]);
        let resolver = AliasResolver::Template("{symbol}-{name}".into());
        let name = assign_name(&reader, "fallback", &[Some(&resolver)], &token())
            .await
            .expect("alias");
        assert_eq!(name, "{name}-X");
    }

    #[tokio::test]
    async fn test_unbalanced_template_is_config_error() {
        let reader = TextReader(vec![("symbol", "USDC")]);
        let resolver = AliasResolver::Template("c{symbol".into());
        let err = assign_name(&reader, "fallback", &[Some(&resolver)], &token())
            .await
            .expect_err("unbalanced");
        assert!(matches!(err, SpiderError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_blank_alias_keeps_default_name() {
        let reader = TextReader(vec![("symbol", "   ")]);
        let resolver = AliasResolver::Call("symbol".into());
        let name = assign_name(&reader, "baseToken", &[None, Some(&resolver)], &token())
            .await
            .expect("alias");
        assert_eq!(name, "baseToken");
    }
}
