use crate::config::NetworkQualityConfig;
use http::HeaderMap;

/// Advisory network-quality gate.
///
/// Reads the standard `RTT` (milliseconds) and `Downlink` (Mbit/s) client
/// hints. Kernel-level RTT would require raw socket options; hints are the
/// portable source, and a request without them always passes — the gate is
/// advisory, never a hard dependency.
pub struct NetworkQualityGate;

impl NetworkQualityGate {
    /// `Ok(())` to admit, `Err(reason)` to reject with 503.
    pub fn evaluate(config: &NetworkQualityConfig, headers: &HeaderMap) -> Result<(), String> {
        if !config.enabled {
            return Ok(());
        }

        if let Some(max_latency) = config.max_latency_ms {
            if let Some(rtt) = header_u64(headers, "rtt") {
                if rtt > max_latency {
                    return Err(format!("rtt {}ms above limit {}ms", rtt, max_latency));
                }
            }
        }

        if let Some(min_kbps) = config.min_bandwidth_kbps {
            if let Some(downlink_mbps) = header_f64(headers, "downlink") {
                let kbps = (downlink_mbps * 1000.0) as u64;
                if kbps < min_kbps {
                    return Err(format!(
                        "downlink {}kbps below limit {}kbps",
                        kbps, min_kbps
                    ));
                }
            }
        }

        Ok(())
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NetworkQualityConfig {
        NetworkQualityConfig {
            enabled: true,
            min_bandwidth_kbps: Some(500),
            max_latency_ms: Some(300),
        }
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_disabled_gate_passes_everything() {
        let config = NetworkQualityConfig::default();
        assert!(NetworkQualityGate::evaluate(&config, &headers(&[("rtt", "9999")])).is_ok());
    }

    #[test]
    fn test_high_rtt_rejected() {
        let err = NetworkQualityGate::evaluate(&config(), &headers(&[("rtt", "450")]))
            .unwrap_err();
        assert!(err.contains("rtt"));
    }

    #[test]
    fn test_low_bandwidth_rejected() {
        let err = NetworkQualityGate::evaluate(&config(), &headers(&[("downlink", "0.2")]))
            .unwrap_err();
        assert!(err.contains("downlink"));
    }

    #[test]
    fn test_good_quality_admitted() {
        let hdrs = headers(&[("rtt", "50"), ("downlink", "10")]);
        assert!(NetworkQualityGate::evaluate(&config(), &hdrs).is_ok());
    }

    #[test]
    fn test_missing_hints_fall_back_to_noop() {
        assert!(NetworkQualityGate::evaluate(&config(), &HeaderMap::new()).is_ok());
    }
}
