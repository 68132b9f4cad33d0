//! Official rate source
//!
//! Reads the sUSDe vault's ERC-4626 `previewDeposit` for one whole USDe and
//! reports the resulting shares as the official rate, together with the
//! block height at the time of the read.

use alloy::{
    primitives::{Address, U256},
    providers::{Provider, ProviderBuilder, RootProvider},
    sol,
    transports::http::{Client, Http},
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::EthereumConfig;
use crate::services::rate_source::{OfficialRateSource, OfficialReading, SourceError};

/// Both tokens use 18 decimals
const TOKEN_DECIMALS: u32 = 18;

sol! {
    #[sol(rpc)]
    interface IERC4626 {
        function previewDeposit(uint256 assets) external view returns (uint256);
    }
}

pub struct VaultOfficialRate {
    provider: RootProvider<Http<Client>>,
    vault: Address,
    request_timeout: Duration,
}

impl VaultOfficialRate {
    /// Create the reader from Ethereum settings
    ///
    /// # Arguments
    ///
    /// * `config` - RPC endpoint, vault address and per-read timeout
    pub fn new(config: &EthereumConfig) -> Result<Self, SourceError> {
        let rpc_url = config
            .rpc_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| SourceError::NotConfigured("ethereum rpc url".to_string()))?;
        let vault_address = config
            .susde_address
            .as_deref()
            .filter(|addr| !addr.trim().is_empty())
            .ok_or_else(|| SourceError::NotConfigured("sUSDe contract address".to_string()))?;

        let provider = ProviderBuilder::new().on_http(
            rpc_url
                .parse()
                .map_err(|e| SourceError::InvalidInput(format!("Invalid RPC URL: {}", e)))?,
        );
        let vault = Address::from_str(vault_address.trim())
            .map_err(|e| SourceError::InvalidInput(format!("Invalid vault address: {}", e)))?;

        let request_timeout = if config.request_timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            config.request_timeout
        };

        info!(vault = %vault, "Official rate source initialized");

        Ok(Self {
            provider,
            vault,
            request_timeout,
        })
    }

    async fn read(&self) -> Result<OfficialReading, SourceError> {
        let contract = IERC4626::new(self.vault, &self.provider);
        let one_token = U256::from(10u64).pow(U256::from(TOKEN_DECIMALS));

        let shares = contract
            .previewDeposit(one_token)
            .call()
            .await
            .map_err(|e| SourceError::Rpc(format!("previewDeposit failed: {}", e)))?
            ._0;

        let rate = scale_token_amount(shares)?;

        let block_number = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| SourceError::Rpc(format!("eth_blockNumber failed: {}", e)))?;

        debug!(rate = %rate, block = block_number, "Read official rate");

        Ok(OfficialReading { rate, block_number })
    }
}

#[async_trait]
impl OfficialRateSource for VaultOfficialRate {
    async fn fetch_official(&self) -> Result<OfficialReading, SourceError> {
        timeout(self.request_timeout, self.read())
            .await
            .map_err(|_| {
                SourceError::Rpc(format!(
                    "official rate read timed out after {:?}",
                    self.request_timeout
                ))
            })?
    }
}

/// Convert an 18-decimal token amount into a whole-token decimal
fn scale_token_amount(amount: U256) -> Result<Decimal, SourceError> {
    let mut value = Decimal::from_str(&amount.to_string()).map_err(|e| {
        SourceError::InvalidResponse(format!("token amount {} out of range: {}", amount, e))
    })?;
    value
        .set_scale(TOKEN_DECIMALS)
        .map_err(|e| SourceError::InvalidResponse(format!("cannot scale {}: {}", amount, e)))?;
    Ok(value.normalize())
}
