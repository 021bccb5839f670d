use std::time::Duration;

use isahc::config::Configurable;
use isahc::{AsyncReadResponseExt, Request};
use serde::Deserialize;
use smallvec::SmallVec;

use super::types::ApiFailure;
use super::LastFmError;

const ENDPOINT: &str = "https://ws.audioscrobbler.com/2.0/?format=json";

/// Builder for signed API requests. Read calls go out as GETs with the
/// signature in the query string; write calls POST a form body.
pub struct RequestBuilder {
    api_key: String,
    params: SmallVec<[(&'static str, String); 8]>,
    endpoint: String,
    signature: Option<String>,
    timeout: Duration,
}

impl RequestBuilder {
    pub fn new(api_key: String, timeout: Duration) -> Self {
        RequestBuilder {
            api_key,
            params: SmallVec::new(),
            endpoint: ENDPOINT.to_string(),
            signature: None,
            timeout,
        }
    }

    pub fn method(self, method: &'static str) -> Self {
        self.param("method", method.to_string())
    }

    pub fn param(mut self, key: &'static str, value: String) -> Self {
        debug_assert!(self.signature.is_none(), "cannot add params after signing");
        self.params.push((key, value));
        self
    }

    pub fn optional_param(self, key: &'static str, value: Option<String>) -> Self {
        match value {
            Some(value) => self.param(key, value),
            None => self,
        }
    }

    /// Sign with the shared secret: md5 over the params sorted by name.
    pub fn sign(mut self, secret: &str) -> Self {
        self.params.insert(0, ("api_key", self.api_key.clone()));
        self.params.sort_by(|a, b| a.0.cmp(b.0));

        let mut sig = String::new();
        for (k, v) in self.params.iter() {
            sig.push_str(k);
            sig.push_str(v);
        }
        sig.push_str(secret);
        self.signature = Some(format!("{:x}", md5::compute(sig)));
        self
    }

    pub async fn get<T: for<'de> Deserialize<'de>>(self) -> Result<T, LastFmError> {
        let mut url = self.endpoint.clone();
        for (k, v) in self.params.iter() {
            url.push('&');
            url.push_str(k);
            url.push('=');
            url.push_str(&urlencoding::encode(v));
        }
        if let Some(signature) = &self.signature {
            url.push_str("&api_sig=");
            url.push_str(signature);
        }

        let request = Request::get(url)
            .timeout(self.timeout)
            .body(())
            .map_err(|e| LastFmError::Request(e.to_string()))?;
        let mut response = isahc::send_async(request).await?;
        decode(&response.text().await?)
    }

    pub async fn post<T: for<'de> Deserialize<'de>>(self) -> Result<T, LastFmError> {
        let mut body = String::new();
        for (k, v) in self.params.iter() {
            body.push_str(k);
            body.push('=');
            body.push_str(&urlencoding::encode(v));
            body.push('&');
        }
        let signature = self
            .signature
            .as_ref()
            .ok_or_else(|| LastFmError::Request("write request was not signed".into()))?;
        body.push_str("api_sig=");
        body.push_str(signature);

        let request = Request::post(self.endpoint.clone())
            .timeout(self.timeout)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .map_err(|e| LastFmError::Request(e.to_string()))?;
        let mut response = isahc::send_async(request).await?;
        decode(&response.text().await?)
    }
}

/// The API signals failure inside a 200 body; check for that shape before
/// decoding the expected one.
fn decode<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, LastFmError> {
    if let Ok(failure) = serde_json::from_str::<ApiFailure>(body) {
        return Err(LastFmError::Api {
            code: failure.error,
            message: failure.message,
        });
    }
    serde_json::from_str(body).map_err(LastFmError::Decode)
}
