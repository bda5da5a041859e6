//! Broker reached over HTTP.

use super::{Broker, BrokerError};
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Serialize)]
struct PublishRequest<'a> {
    topic: &'a str,
    args: &'a [Value],
    kwargs: &'a Map<String, Value>,
}

/// Broker publishing through an HTTP endpoint.
///
/// Each publish POSTs `{"topic", "args", "kwargs"}` as JSON; any non-2xx
/// answer counts as a failure. The client is blocking, so create and drop
/// it outside async contexts; async callers reach it through
/// `spawn_blocking`.
pub struct HttpBroker {
    client: Client,
    url: String,
}

impl HttpBroker {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, BrokerError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Broker for HttpBroker {
    fn publish(
        &self,
        topic: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<(), BrokerError> {
        let response = self
            .client
            .post(&self.url)
            .json(&PublishRequest {
                topic,
                args,
                kwargs,
            })
            .send()
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(BrokerError::Status(status.as_u16()))
        }
    }
}
