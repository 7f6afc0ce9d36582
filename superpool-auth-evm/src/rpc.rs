//! JSON-RPC backed [`SafeContractSource`].

use std::collections::HashMap;

use alloy_primitives::Address;
use alloy_provider::RootProvider;
use url::Url;

use crate::safe::{OnchainSafe, SafeContractSource};

/// One HTTP provider per configured chain.
///
/// Requests for chains without an endpoint, or without a chain id at all,
/// resolve to no contract and end on the fallback path.
#[derive(Debug, Clone, Default)]
pub struct RpcSafeSource {
    providers: HashMap<u64, RootProvider>,
}

impl RpcSafeSource {
    /// Creates a source with no chains.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `url` as the endpoint for `chain_id`.
    #[must_use]
    pub fn with_chain(mut self, chain_id: u64, url: Url) -> Self {
        self.insert(chain_id, url);
        self
    }

    /// Registers `url` as the endpoint for `chain_id`, replacing any previous one.
    pub fn insert(&mut self, chain_id: u64, url: Url) {
        tracing::info!(chain_id, %url, "Registered Safe RPC endpoint");
        self.providers.insert(chain_id, RootProvider::new_http(url));
    }

    /// Chains with an endpoint.
    pub fn chains(&self) -> impl Iterator<Item = u64> + '_ {
        self.providers.keys().copied()
    }
}

impl SafeContractSource for RpcSafeSource {
    type Contract = OnchainSafe<RootProvider>;

    fn safe_at(&self, address: Address, chain_id: Option<u64>) -> Option<Self::Contract> {
        let provider = self.providers.get(&chain_id?)?;
        Some(OnchainSafe::new(address, provider.clone()))
    }
}
