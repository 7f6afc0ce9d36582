//! [`AuthRpc`] over JSON/HTTP.
//!
//! Both callables are `POST` requests with the protocol types as bodies. A
//! non-2xx response carries `{ "error": "<message>" }`. Session backends use
//! the same client to redeem custom tokens.

use std::time::Duration;

use http::{HeaderMap, StatusCode};
use reqwest::Client;
use superpool_auth::proto::{
    AuthRpc, AuthenticatedUser, ErrorBody, GenerateAuthMessageRequest,
    GenerateAuthMessageResponse, RedeemTokenRequest, VerifySignatureRequest,
    VerifySignatureResponse,
};
use url::Url;

use crate::error::HttpRpcError;

/// Client for a remote authentication backend.
#[derive(Clone, Debug)]
pub struct HttpAuthRpc {
    base_url: Url,
    generate_url: Url,
    verify_url: Url,
    redeem_url: Url,
    client: Client,
    headers: HeaderMap,
    timeout: Option<Duration>,
}

impl HttpAuthRpc {
    /// Constructs a client for the backend rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`HttpRpcError::UrlParse`] if the endpoint URLs cannot be built.
    pub fn try_new(base_url: Url) -> Result<Self, HttpRpcError> {
        let generate_url =
            base_url
                .join("./generateAuthMessage")
                .map_err(|source| HttpRpcError::UrlParse {
                    context: "Failed to construct ./generateAuthMessage URL",
                    source,
                })?;
        let verify_url =
            base_url
                .join("./verifySignatureAndLogin")
                .map_err(|source| HttpRpcError::UrlParse {
                    context: "Failed to construct ./verifySignatureAndLogin URL",
                    source,
                })?;
        let redeem_url =
            base_url
                .join("./redeemCustomToken")
                .map_err(|source| HttpRpcError::UrlParse {
                    context: "Failed to construct ./redeemCustomToken URL",
                    source,
                })?;
        Ok(Self {
            base_url,
            generate_url,
            verify_url,
            redeem_url,
            client: Client::new(),
            headers: HeaderMap::new(),
            timeout: None,
        })
    }

    /// Base URL of the backend.
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Attaches custom headers to all future requests.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Sets a timeout for all future requests.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Exchanges a custom token for the user it was issued to.
    ///
    /// # Errors
    ///
    /// Returns [`HttpRpcError::Rejected`] with status 401 when the backend did
    /// not issue the token, it was already redeemed, or it expired.
    pub async fn redeem_custom_token(
        &self,
        custom_token: &str,
    ) -> Result<AuthenticatedUser, HttpRpcError> {
        let body = RedeemTokenRequest {
            custom_token: custom_token.to_owned(),
        };
        self.post_json(&self.redeem_url, "POST /redeemCustomToken", &body)
            .await
    }

    #[tracing::instrument(skip_all, fields(context = context, timeout = ?self.timeout), err)]
    async fn post_json<T, R>(
        &self,
        url: &Url,
        context: &'static str,
        payload: &T,
    ) -> Result<R, HttpRpcError>
    where
        T: serde::Serialize + Sync + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let mut req = self.client.post(url.clone()).json(payload);
        for (key, value) in &self.headers {
            req = req.header(key, value);
        }
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let response = req
            .send()
            .await
            .map_err(|e| HttpRpcError::transport(context, e))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<R>()
                .await
                .map_err(|source| HttpRpcError::JsonDeserialization { context, source });
        }

        let body = response
            .text()
            .await
            .map_err(|e| HttpRpcError::transport(context, e))?;
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(body);
        if status == StatusCode::TOO_MANY_REQUESTS {
            Err(HttpRpcError::RateLimited { message })
        } else {
            Err(HttpRpcError::Rejected { status, message })
        }
    }
}

impl TryFrom<&str> for HttpAuthRpc {
    type Error = HttpRpcError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut normalized = value.trim_end_matches('/').to_owned();
        normalized.push('/');
        let url = Url::parse(&normalized).map_err(|source| HttpRpcError::UrlParse {
            context: "Failed to parse base url",
            source,
        })?;
        Self::try_new(url)
    }
}

impl AuthRpc for HttpAuthRpc {
    type Error = HttpRpcError;

    async fn generate_auth_message(
        &self,
        request: &GenerateAuthMessageRequest,
    ) -> Result<GenerateAuthMessageResponse, HttpRpcError> {
        self.post_json(&self.generate_url, "POST /generateAuthMessage", request)
            .await
    }

    async fn verify_signature_and_login(
        &self,
        request: &VerifySignatureRequest,
    ) -> Result<VerifySignatureResponse, HttpRpcError> {
        self.post_json(&self.verify_url, "POST /verifySignatureAndLogin", request)
            .await
    }
}
