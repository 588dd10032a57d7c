// Order endpoints. Cancels use a JSON body (v2 API), leverage is sent as a
// string under POST /products/{id}/orders/leverage.

use serde_json::json;

use super::client::Client;
use super::error::VenueError;
use super::types::{Order, OrderRequest};

impl Client {
    pub async fn place_order(&self, req: &OrderRequest) -> Result<Order, VenueError> {
        let body = serde_json::to_value(req).map_err(|e| VenueError::Parse {
            reason: format!("marshal order request: {e}"),
            body: String::new(),
        })?;
        let resp = self.post("/orders", &body).await?;
        resp.parse_result()
    }

    pub async fn cancel_order(&self, order_id: i64, product_id: i64) -> Result<(), VenueError> {
        let body = json!({ "id": order_id, "product_id": product_id });
        self.delete_with_body("/orders", &body).await?;
        Ok(())
    }

    /// Cancels all open orders, optionally scoped to one product.
    pub async fn cancel_all_orders(&self, product_id: Option<i64>) -> Result<(), VenueError> {
        let body = match product_id {
            Some(id) => json!({ "product_id": id }),
            None => json!({}),
        };
        self.delete_with_body("/orders/all", &body).await?;
        Ok(())
    }

    pub async fn get_active_orders(
        &self,
        product_id: Option<i64>,
    ) -> Result<Vec<Order>, VenueError> {
        let mut query = vec![("state", "open".to_string())];
        if let Some(id) = product_id {
            query.push(("product_id", id.to_string()));
        }
        let resp = self.get("/orders", &query).await?;
        resp.parse_result()
    }

    pub async fn get_order(&self, order_id: i64) -> Result<Order, VenueError> {
        let resp = self.get(&format!("/orders/{order_id}"), &[]).await?;
        resp.parse_result()
    }

    /// Sets leverage for a product. The venue expects the value as a string.
    pub async fn set_leverage(&self, product_id: i64, leverage: u32) -> Result<(), VenueError> {
        let body = json!({ "leverage": leverage.to_string() });
        self.post(&format!("/products/{product_id}/orders/leverage"), &body)
            .await?;
        Ok(())
    }
}
