pub mod alias;
pub mod composer;
pub mod contract_map;
pub mod crawler;
pub mod proxy;
pub mod relation;

pub use composer::DeploymentComposer;
pub use contract_map::{ContractHandle, ContractMap, ContractMapBuilder};
pub use crawler::{
    ContractNode, CrawlReport, DeploymentImports, GraphCrawler, NoImports, NodeError, NodeOrigin,
    Session,
};
pub use proxy::resolve_implementation;
