use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, trace};
use weave_core::payment::{
    CreateIntentParams, CreatePaymentLinkParams, IntentStatus, NextAction, PaymentGateway, PaymentIntent,
    PaymentLink,
};
use weave_core::{CoreError, CoreResult};
use weave_shared::{Currency, Masked};

/// Card gateway speaking the Stripe REST dialect (form-encoded requests, JSON replies).
#[derive(Clone)]
pub struct StripeGateway {
    api_base_url: String,
    client: Arc<Client>,
}

#[derive(Deserialize)]
struct StripeIntent {
    id: String,
    amount: i64,
    currency: String,
    status: String,
    client_secret: Option<String>,
    next_action: Option<StripeNextAction>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    created: i64,
}

#[derive(Deserialize)]
struct StripeNextAction {
    #[serde(rename = "type")]
    kind: String,
    redirect_to_url: Option<StripeRedirect>,
}

#[derive(Deserialize)]
struct StripeRedirect {
    url: Option<String>,
}

#[derive(Deserialize)]
struct StripeObject {
    id: String,
    url: Option<String>,
}

fn intent_status(raw: &str) -> CoreResult<IntentStatus> {
    match raw {
        "requires_payment_method" => Ok(IntentStatus::RequiresPaymentMethod),
        "requires_confirmation" => Ok(IntentStatus::RequiresConfirmation),
        "requires_action" => Ok(IntentStatus::RequiresAction),
        "processing" => Ok(IntentStatus::Processing),
        "succeeded" => Ok(IntentStatus::Succeeded),
        "canceled" => Ok(IntentStatus::Canceled),
        "requires_capture" => Ok(IntentStatus::Processing),
        other => Err(CoreError::GatewayError(format!("unknown intent status {}", other))),
    }
}

impl TryFrom<StripeIntent> for PaymentIntent {
    type Error = CoreError;

    fn try_from(raw: StripeIntent) -> CoreResult<Self> {
        Ok(PaymentIntent {
            id: raw.id,
            amount: raw.amount,
            currency: Currency::from_str(&raw.currency).map_err(|e| CoreError::GatewayError(e.to_string()))?,
            status: intent_status(&raw.status)?,
            client_secret: raw.client_secret.map(Masked),
            next_action: raw.next_action.map(|a| NextAction {
                kind: a.kind,
                redirect_url: a.redirect_to_url.and_then(|r| r.url),
            }),
            metadata: raw.metadata,
            created_at: Utc.timestamp_opt(raw.created, 0).single().unwrap_or_else(Utc::now),
        })
    }
}

fn metadata_form(metadata: &BTreeMap<String, String>, form: &mut Vec<(String, String)>) {
    for (key, value) in metadata {
        form.push((format!("metadata[{}]", key), value.clone()));
    }
}

impl StripeGateway {
    pub fn new(api_base_url: &str, secret_key: &str) -> CoreResult<Self> {
        let mut headers = HeaderMap::with_capacity(1);
        let val = HeaderValue::from_str(&format!("Bearer {}", secret_key))
            .map_err(|e| CoreError::GatewayError(e.to_string()))?;
        headers.insert(AUTHORIZATION, val);
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| CoreError::GatewayError(e.to_string()))?;
        Ok(Self {
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            client: Arc::new(client),
        })
    }

    async fn rest_query<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        form: &[(String, String)],
    ) -> CoreResult<T> {
        let url = format!("{}{}", self.api_base_url, path);
        trace!("Sending gateway request: {} {}", method, url);
        let mut req = self.client.request(method, url);
        if !form.is_empty() {
            req = req.form(form);
        }
        let response = req.send().await.map_err(|e| CoreError::GatewayError(e.to_string()))?;
        if response.status().is_success() {
            response.json::<T>().await.map_err(|e| CoreError::GatewayError(e.to_string()))
        } else {
            let status = response.status().as_u16();
            let message = response.text().await.map_err(|e| CoreError::GatewayError(e.to_string()))?;
            Err(CoreError::GatewayError(format!("{}: {}", status, message)))
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_payment_intent(&self, params: CreateIntentParams) -> CoreResult<PaymentIntent> {
        let mut form = vec![
            ("amount".to_string(), params.amount.to_string()),
            ("currency".to_string(), params.currency.as_str().to_lowercase()),
            ("payment_method_types[]".to_string(), "card".to_string()),
            ("description".to_string(), format!("Checkout for buyer {}", params.customer)),
        ];
        metadata_form(&params.metadata, &mut form);

        let raw: StripeIntent = self.rest_query(Method::POST, "/payment_intents", &form).await?;
        info!("Created payment intent {} for {} minor units", raw.id, raw.amount);
        raw.try_into()
    }

    async fn confirm_payment_intent(&self, intent_id: &str, return_url: &str) -> CoreResult<PaymentIntent> {
        let form = vec![("return_url".to_string(), return_url.to_string())];
        let path = format!("/payment_intents/{}/confirm", intent_id);
        let raw: StripeIntent = self.rest_query(Method::POST, &path, &form).await?;
        debug!("Confirmed payment intent {}: {}", raw.id, raw.status);
        raw.try_into()
    }

    async fn retrieve_payment_intent(&self, intent_id: &str) -> CoreResult<PaymentIntent> {
        let path = format!("/payment_intents/{}", intent_id);
        let raw: StripeIntent = self.rest_query(Method::GET, &path, &[]).await?;
        raw.try_into()
    }

    async fn refund_payment_intent(&self, intent_id: &str, metadata: BTreeMap<String, String>) -> CoreResult<()> {
        let mut form = vec![("payment_intent".to_string(), intent_id.to_string())];
        metadata_form(&metadata, &mut form);
        let refund: StripeObject = self.rest_query(Method::POST, "/refunds", &form).await?;
        info!("Refund {} issued for intent {}", refund.id, intent_id);
        Ok(())
    }

    async fn create_payment_link(&self, params: CreatePaymentLinkParams) -> CoreResult<PaymentLink> {
        let currency = params.currency.as_str().to_lowercase();
        let mut form = Vec::with_capacity(params.line_items.len() * 2 + 4);

        // Payment links only accept stored prices, so each line gets a one-off price first.
        for (i, line) in params.line_items.iter().enumerate() {
            let price_form = vec![
                ("currency".to_string(), currency.clone()),
                ("unit_amount".to_string(), line.unit_amount.to_string()),
                ("product_data[name]".to_string(), line.name.clone()),
            ];
            let price: StripeObject = self.rest_query(Method::POST, "/prices", &price_form).await?;
            form.push((format!("line_items[{}][price]", i), price.id));
            form.push((format!("line_items[{}][quantity]", i), line.quantity.to_string()));
        }
        form.push(("after_completion[type]".to_string(), "redirect".to_string()));
        form.push(("after_completion[redirect][url]".to_string(), params.redirect_url.clone()));
        metadata_form(&params.metadata, &mut form);

        let link: StripeObject = self.rest_query(Method::POST, "/payment_links", &form).await?;
        let url = link
            .url
            .ok_or_else(|| CoreError::GatewayError(format!("payment link {} has no url", link.id)))?;
        info!("Created payment link {}", link.id);
        Ok(PaymentLink { id: link.id, url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_parsing() {
        let raw: StripeIntent = serde_json::from_str(
            r#"{
                "id": "pi_123",
                "amount": 11500,
                "currency": "usd",
                "status": "requires_action",
                "client_secret": "pi_123_secret_abc",
                "next_action": {"type": "redirect_to_url", "redirect_to_url": {"url": "https://bank.example/3ds"}},
                "metadata": {"checkout_session_id": "cs_1"},
                "created": 1717200000
            }"#,
        )
        .unwrap();
        let intent = PaymentIntent::try_from(raw).unwrap();
        assert_eq!(intent.currency, Currency::USD);
        assert_eq!(intent.status, IntentStatus::RequiresAction);
        assert_eq!(
            intent.next_action.and_then(|a| a.redirect_url).as_deref(),
            Some("https://bank.example/3ds")
        );
        assert_eq!(intent.metadata.get("checkout_session_id").map(String::as_str), Some("cs_1"));
    }

    #[test]
    fn test_unknown_status_is_gateway_error() {
        assert!(matches!(intent_status("exploded"), Err(CoreError::GatewayError(_))));
        assert_eq!(intent_status("succeeded").unwrap(), IntentStatus::Succeeded);
    }

    #[test]
    fn test_metadata_is_bracket_encoded() {
        let mut metadata = BTreeMap::new();
        metadata.insert("user_id".to_string(), "u1".to_string());
        let mut form = Vec::new();
        metadata_form(&metadata, &mut form);
        assert_eq!(form, vec![("metadata[user_id]".to_string(), "u1".to_string())]);
    }
}
