//! Reqwest-backed implementation of the [`Transport`] trait.
//!
//! Provides the default browser identity: a reqwest client with a cookie
//! jar, automatic gzip/br/zstd decoding, redirects disabled (the retry
//! engine owns redirect handling), and a User-Agent derived from the
//! emulation profile. Dedicated TLS-emulation backends plug in behind the
//! same trait.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use url::Url;

use super::{
    Emulation, RequestBody, Transport, TransportConfig, TransportError, TransportFactory,
    TransportRequest, TransportResponse,
};

/// Chrome major versions the default transport can present, newest first.
const CHROME_VERSIONS: &[u16] = &[
    145, 144, 143, 142, 141, 140, 139, 138, 137, 136, 135, 134, 133, 132, 131, 130,
];

/// Safari versions available as the alternate identity.
const SAFARI_VERSIONS: &[u16] = &[18, 17];

fn ua_platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "Macintosh; Intel Mac OS X 10_15_7",
        "windows" => "Windows NT 10.0; Win64; x64",
        _ => "X11; Linux x86_64",
    }
}

fn user_agent_for(emulation: Emulation) -> String {
    match emulation {
        Emulation::Chrome(v) => format!(
            "Mozilla/5.0 ({}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{v}.0.0.0 Safari/537.36",
            ua_platform()
        ),
        Emulation::Safari(v) => format!(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 \
             (KHTML, like Gecko) Version/{v}.0 Safari/605.1.15"
        ),
    }
}

/// Default transport used when no TLS-emulation backend is injected.
pub struct ReqwestTransport {
    client: reqwest::Client,
    jar: Arc<Jar>,
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.request(request.method, request.url.clone());

        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TransportError::Header(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| TransportError::Header(name.to_string()))?;
            builder = builder.header(name, value);
        }

        match request.body {
            Some(RequestBody::Bytes(bytes)) => builder = builder.body(bytes),
            Some(RequestBody::Form(fields)) => builder = builder.form(&fields),
            Some(RequestBody::Json(value)) => builder = builder.json(&value),
            None => {}
        }

        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError::Decode(err.to_string()))?;

        Ok(TransportResponse {
            status,
            headers,
            url,
            body,
        })
    }

    fn add_cookie(&self, raw_set_cookie: &str, url: &Url) -> Result<(), TransportError> {
        // Jar::add_cookie_str silently drops unparseable lines; reject
        // nameless lines here so callers can log the failure.
        if !raw_set_cookie.find('=').is_some_and(|idx| idx > 0) {
            return Err(TransportError::Other(
                "Set-Cookie line has no cookie name".into(),
            ));
        }
        self.jar.add_cookie_str(raw_set_cookie, url);
        Ok(())
    }
}

/// Factory producing [`ReqwestTransport`] instances.
#[derive(Debug, Default, Clone)]
pub struct ReqwestTransportFactory;

impl ReqwestTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

impl TransportFactory for ReqwestTransportFactory {
    fn emulations(&self) -> Vec<Emulation> {
        CHROME_VERSIONS
            .iter()
            .map(|v| Emulation::Chrome(*v))
            .chain(SAFARI_VERSIONS.iter().map(|v| Emulation::Safari(*v)))
            .collect()
    }

    fn build(&self, config: &TransportConfig) -> Result<Arc<dyn Transport>, TransportError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TransportError::Header(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| TransportError::Header(name.to_string()))?;
            headers.insert(name, value);
        }
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_str(&user_agent_for(config.emulation))
                .map_err(|_| TransportError::Header("user-agent".into()))?,
        );

        let jar = Arc::new(Jar::default());
        let mut builder = reqwest::Client::builder()
            .redirect(Policy::none())
            .cookie_provider(jar.clone())
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true)
            .zstd(true);

        if let Some(ref proxy) = config.proxy {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy)
                    .map_err(|err| TransportError::Other(err.to_string()))?,
            );
        }

        let client = builder
            .build()
            .map_err(|err| TransportError::Other(err.to_string()))?;

        Ok(Arc::new(ReqwestTransport { client, jar }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn factory_pool_has_chrome_and_safari() {
        let factory = ReqwestTransportFactory::new();
        let pool = factory.emulations();
        assert!(pool.contains(&Emulation::Chrome(145)));
        assert!(pool.contains(&Emulation::Chrome(133)));
        assert!(pool.iter().any(|e| e.is_safari()));
    }

    #[test]
    fn chrome_user_agent_carries_version() {
        let ua = user_agent_for(Emulation::Chrome(133));
        assert!(ua.contains("Chrome/133.0.0.0"));
        let ua = user_agent_for(Emulation::Safari(18));
        assert!(ua.contains("Version/18.0"));
    }

    #[test]
    fn builds_client_with_defaults() {
        let factory = ReqwestTransportFactory::new();
        let config = TransportConfig {
            emulation: Emulation::Chrome(145),
            headers: [("Accept".to_string(), "*/*".to_string())].into(),
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            proxy: None,
        };
        assert!(factory.build(&config).is_ok());
    }
}
