//! Solidity definitions used for verification.
//!
//! - [`ISafe`]: the subset of the Safe singleton ABI read during EIP-1271
//!   verification
//! - [`Authentication`]: EIP-712 struct for typed-data challenges

use alloy_primitives::{FixedBytes, U256, fixed_bytes};
use alloy_sol_types::{Eip712Domain, sol};
use superpool_auth::proto::{TYPED_DATA_DOMAIN_NAME, TYPED_DATA_DOMAIN_VERSION};

/// Return value of a successful `isValidSignature(bytes32,bytes)` call.
///
/// Reference: <https://eips.ethereum.org/EIPS/eip-1271>
pub const EIP1271_MAGIC_VALUE: FixedBytes<4> = fixed_bytes!("1626ba7e");

sol! {
    /// Read-only Safe interface.
    ///
    /// Reference: <https://github.com/safe-global/safe-smart-account>
    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface ISafe {
        function VERSION() external view returns (string);
        function getThreshold() external view returns (uint256);
        function getOwners() external view returns (address[]);
        function isOwner(address owner) external view returns (bool);
        function isValidSignature(bytes32 _hash, bytes calldata _signature) external view returns (bytes4);
    }
}

sol! {
    /// Typed-data form of the sign-in challenge.
    #[allow(missing_docs)]
    #[derive(Debug)]
    struct Authentication {
        address wallet;
        string nonce;
        uint256 timestamp;
        string message;
    }
}

/// EIP-712 domain for typed-data challenges on `chain_id`.
#[must_use]
pub fn auth_domain(chain_id: Option<u64>) -> Eip712Domain {
    Eip712Domain::new(
        Some(TYPED_DATA_DOMAIN_NAME.into()),
        Some(TYPED_DATA_DOMAIN_VERSION.into()),
        chain_id.map(U256::from),
        None,
        None,
    )
}
