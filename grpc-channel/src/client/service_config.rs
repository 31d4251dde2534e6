/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! The in-memory representation of a service config, usually provided to
//! gRPC as a JSON object by the name resolver.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;

/// Per-method policy from the service config.
#[derive(Debug, Default, Clone)]
pub struct MethodConfig {
    pub timeout: Option<Duration>,
    pub wait_for_ready: Option<bool>,
    pub max_request_message_bytes: Option<usize>,
    pub max_response_message_bytes: Option<usize>,
}

/// A parsed service config.
#[derive(Debug, Default, Clone)]
pub struct ServiceConfig {
    /// Load-balancing policy names in preference order.
    lb_policies: Vec<String>,
    /// Method configs keyed by `(service, Some(method))`, `(service, None)`
    /// for service-wide defaults, and `("", None)` for the global default.
    methods: HashMap<(String, Option<String>), MethodConfig>,
    /// The retry throttle shared with the call sites.
    pub retry_throttle: Option<Arc<RetryThrottle>>,
}

impl ServiceConfig {
    /// Parse the standard JSON representation.
    pub fn parse_json(json: &str) -> Result<Self, crate::Error> {
        let raw: RawServiceConfig = serde_json::from_str(json)?;

        let mut lb_policies = Vec::new();
        for entry in raw.load_balancing_config {
            // Each entry is an object with exactly one key: the policy name.
            let mut names: Vec<String> = entry.into_keys().collect();
            if names.len() != 1 {
                return Err("loadBalancingConfig entries must contain exactly one policy".into());
            }
            lb_policies.push(names.pop().unwrap_or_default());
        }

        let mut methods = HashMap::new();
        for raw_method in raw.method_config {
            let config = MethodConfig {
                timeout: raw_method.timeout.as_deref().map(parse_duration).transpose()?,
                wait_for_ready: raw_method.wait_for_ready,
                max_request_message_bytes: raw_method.max_request_message_bytes,
                max_response_message_bytes: raw_method.max_response_message_bytes,
            };
            for name in raw_method.name {
                let service = name.service.unwrap_or_default();
                let method = match name.method {
                    Some(method) if !service.is_empty() => Some(method),
                    Some(_) => {
                        return Err("methodConfig name with a method requires a service".into());
                    }
                    None => None,
                };
                methods.insert((service, method), config.clone());
            }
        }

        let retry_throttle = raw
            .retry_throttling
            .map(|t| RetryThrottle::new(t.max_tokens, t.token_ratio))
            .transpose()?
            .map(Arc::new);

        Ok(Self {
            lb_policies,
            methods,
            retry_throttle,
        })
    }

    /// The configured LB policy names, most preferred first.
    pub fn lb_policies(&self) -> &[String] {
        &self.lb_policies
    }

    /// Look up the config for a method path of the form `/service/method`,
    /// preferring the exact method entry, then the service-wide entry, then
    /// the global default.
    pub fn method_config(&self, path: &str) -> Option<&MethodConfig> {
        let mut parts = path.trim_start_matches('/').splitn(2, '/');
        let service = parts.next().unwrap_or_default();
        let method = parts.next().unwrap_or_default();

        self.methods
            .get(&(service.to_string(), Some(method.to_string())))
            .or_else(|| self.methods.get(&(service.to_string(), None)))
            .or_else(|| self.methods.get(&(String::new(), None)))
    }
}

/// A token bucket shared between the channel and retrying call sites, per the
/// standard gRPC retry throttling scheme.  The channel only maintains the
/// arithmetic; the retry policy itself lives at the call site.
#[derive(Debug)]
pub struct RetryThrottle {
    max_tokens: f64,
    token_ratio: f64,
    tokens: Mutex<f64>,
}

impl RetryThrottle {
    pub fn new(max_tokens: f64, token_ratio: f64) -> Result<Self, crate::Error> {
        if max_tokens <= 0.0 {
            return Err("retryThrottling.maxTokens must be greater than zero".into());
        }
        if token_ratio <= 0.0 {
            return Err("retryThrottling.tokenRatio must be greater than zero".into());
        }
        Ok(Self {
            max_tokens,
            token_ratio,
            tokens: Mutex::new(max_tokens),
        })
    }

    /// Record a failed attempt, draining one token.
    pub fn record_failure(&self) {
        let mut tokens = self.tokens.lock();
        *tokens = (*tokens - 1.0).max(0.0);
    }

    /// Record a successful attempt, refunding a fraction of a token.
    pub fn record_success(&self) {
        let mut tokens = self.tokens.lock();
        *tokens = (*tokens + self.token_ratio).min(self.max_tokens);
    }

    /// Whether retries should currently be suppressed.
    pub fn is_throttled(&self) -> bool {
        *self.tokens.lock() <= self.max_tokens / 2.0
    }
}

fn parse_duration(value: &str) -> Result<Duration, crate::Error> {
    let seconds = value
        .strip_suffix('s')
        .ok_or("durations must be in seconds, e.g. \"1.5s\"")?;
    let seconds: f64 = seconds
        .parse()
        .map_err(|err| format!("invalid duration {value:?}: {err}"))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(format!("invalid duration {value:?}").into());
    }
    Ok(Duration::from_secs_f64(seconds))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServiceConfig {
    #[serde(default)]
    load_balancing_config: Vec<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    method_config: Vec<RawMethodConfig>,
    retry_throttling: Option<RawRetryThrottling>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMethodConfig {
    #[serde(default)]
    name: Vec<RawMethodName>,
    timeout: Option<String>,
    wait_for_ready: Option<bool>,
    max_request_message_bytes: Option<usize>,
    max_response_message_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMethodName {
    service: Option<String>,
    method: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRetryThrottling {
    max_tokens: f64,
    token_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "loadBalancingConfig": [ {"round_robin": {}}, {"pick_first": {}} ],
        "methodConfig": [
            {
                "name": [ {"service": "echo.Echo", "method": "Get"} ],
                "timeout": "1.5s",
                "waitForReady": true,
                "maxRequestMessageBytes": 1024
            },
            {
                "name": [ {"service": "echo.Echo"} ],
                "timeout": "10s"
            },
            {
                "name": [ {} ],
                "maxResponseMessageBytes": 4096
            }
        ],
        "retryThrottling": { "maxTokens": 10, "tokenRatio": 0.5 }
    }"#;

    #[test]
    fn parses_lb_policies_in_preference_order() {
        let config = ServiceConfig::parse_json(CONFIG).unwrap();
        assert_eq!(config.lb_policies(), &["round_robin", "pick_first"]);
    }

    #[test]
    fn method_lookup_prefers_most_specific() {
        let config = ServiceConfig::parse_json(CONFIG).unwrap();

        let exact = config.method_config("/echo.Echo/Get").unwrap();
        assert_eq!(exact.timeout, Some(Duration::from_secs_f64(1.5)));
        assert_eq!(exact.wait_for_ready, Some(true));
        assert_eq!(exact.max_request_message_bytes, Some(1024));

        let service_wide = config.method_config("/echo.Echo/Other").unwrap();
        assert_eq!(service_wide.timeout, Some(Duration::from_secs(10)));

        let fallback = config.method_config("/other.Service/M").unwrap();
        assert_eq!(fallback.max_response_message_bytes, Some(4096));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(ServiceConfig::parse_json("{").is_err());
        assert!(ServiceConfig::parse_json(r#"{"methodConfig": 4}"#).is_err());
    }

    #[test]
    fn invalid_timeout_is_an_error() {
        let json = r#"{"methodConfig": [{"name": [{}], "timeout": "5"}]}"#;
        assert!(ServiceConfig::parse_json(json).is_err());
    }

    #[test]
    fn method_with_no_service_is_an_error() {
        let json = r#"{"methodConfig": [{"name": [{"method": "Get"}]}]}"#;
        assert!(ServiceConfig::parse_json(json).is_err());
    }

    #[test]
    fn retry_throttle_token_arithmetic() {
        let throttle = RetryThrottle::new(4.0, 0.5).unwrap();
        assert!(!throttle.is_throttled());

        throttle.record_failure();
        throttle.record_failure();
        // Tokens now 2.0 == max/2: throttled.
        assert!(throttle.is_throttled());

        throttle.record_success();
        // 2.5 > 2.0: unthrottled again.
        assert!(!throttle.is_throttled());

        for _ in 0..10 {
            throttle.record_failure();
        }
        assert!(throttle.is_throttled());
        for _ in 0..20 {
            throttle.record_success();
        }
        // Refunds clamp at max_tokens.
        assert!(!throttle.is_throttled());
    }

    #[test]
    fn empty_config_parses() {
        let config = ServiceConfig::parse_json("{}").unwrap();
        assert!(config.lb_policies().is_empty());
        assert!(config.method_config("/a/b").is_none());
        assert!(config.retry_throttle.is_none());
    }
}
