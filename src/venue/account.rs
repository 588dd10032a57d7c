// Wallet and position endpoints.

use serde_json::json;

use super::client::Client;
use super::error::VenueError;
use super::types::{Position, Wallet, WalletMeta};

/// Wallet balances plus the meta block carrying venue-reported net equity.
#[derive(Debug, Clone, Default)]
pub struct WalletBalances {
    pub wallets: Vec<Wallet>,
    pub meta: WalletMeta,
}

impl Client {
    pub async fn get_wallet_balances(&self) -> Result<WalletBalances, VenueError> {
        let resp = self.get("/wallet/balances", &[]).await?;
        let wallets: Vec<Wallet> = resp.parse_result()?;
        // Meta parsing is optional; malformed meta never fails the call.
        let meta = resp
            .meta
            .as_ref()
            .and_then(|m| serde_json::from_value(m.clone()).ok())
            .unwrap_or_default();
        Ok(WalletBalances { wallets, meta })
    }

    pub async fn get_available_balance(&self, asset_symbol: &str) -> Result<f64, VenueError> {
        let balances = self.get_wallet_balances().await?;
        let wallet = balances
            .wallets
            .iter()
            .find(|w| w.asset_symbol == asset_symbol)
            .ok_or_else(|| VenueError::Parse {
                reason: format!("wallet for asset {asset_symbol} not found"),
                body: String::new(),
            })?;
        wallet.available_balance.parse().map_err(|e| VenueError::Parse {
            reason: format!("failed to parse available balance: {e}"),
            body: wallet.available_balance.clone(),
        })
    }

    /// Venue-reported net equity; errors when the meta block is absent.
    pub async fn get_net_equity(&self) -> Result<f64, VenueError> {
        let balances = self.get_wallet_balances().await?;
        if balances.meta.net_equity.is_empty() {
            return Err(VenueError::Parse {
                reason: "net equity not available".to_string(),
                body: String::new(),
            });
        }
        balances.meta.net_equity.parse().map_err(|e| VenueError::Parse {
            reason: format!("failed to parse net equity: {e}"),
            body: balances.meta.net_equity.clone(),
        })
    }

    pub async fn get_positions(&self) -> Result<Vec<Position>, VenueError> {
        let resp = self.get("/positions/margined", &[]).await?;
        resp.parse_result()
    }

    pub async fn get_position(&self, product_id: i64) -> Result<Position, VenueError> {
        let query = [("product_id", product_id.to_string())];
        let resp = self.get("/positions", &query).await?;
        resp.parse_result()
    }

    pub async fn close_all_positions(&self) -> Result<(), VenueError> {
        let body = json!({
            "close_all_portfolio": true,
            "close_all_isolated": true,
        });
        self.post("/positions/close_all", &body).await?;
        Ok(())
    }

    pub async fn add_position_margin(
        &self,
        product_id: i64,
        margin_delta: &str,
    ) -> Result<(), VenueError> {
        let body = json!({
            "product_id": product_id,
            "delta_margin": margin_delta,
        });
        self.post("/positions/change_margin", &body).await?;
        Ok(())
    }
}
