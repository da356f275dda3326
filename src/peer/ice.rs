use tracing::{info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::peer::types::{IceCandidate, ServerConfig};
use crate::utils::add_ice_url_scheme;

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

/// Конфигурация серверов в формате webrtc
pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    info!(
        host = summary.host,
        srflx = summary.srflx,
        relay = summary.relay,
        "candidate analysis"
    );

    if summary.relay == 0 {
        warn!("no TURN relay candidates found, connection through NAT may fail");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_candidate_types() {
        let candidates = vec![
            IceCandidate::new("candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host"),
            IceCandidate::new("candidate:2 1 udp 1694498815 1.2.3.4 50001 typ srflx raddr 10.0.0.2 rport 50000"),
            IceCandidate::new("candidate:3 1 udp 16777215 5.6.7.8 3478 typ relay raddr 1.2.3.4 rport 50001"),
            IceCandidate::new("candidate:4 1 udp 2130706431 10.0.0.3 50002 typ host"),
        ];
        assert_eq!(
            analyze_candidates(&candidates),
            CandidateSummary {
                host: 2,
                srflx: 1,
                relay: 1
            }
        );
    }

    #[test]
    fn server_urls_get_a_scheme() {
        let servers = vec![
            ServerConfig::stun("a", "stun.l.google.com:19302"),
            ServerConfig {
                id: "b".into(),
                r#type: "turn".into(),
                url: "turn.example.org:3478".into(),
                username: Some("u".into()),
                credential: Some("p".into()),
            },
        ];
        let converted = ice_servers(&servers);
        assert_eq!(converted[0].urls, vec!["stun:stun.l.google.com:19302"]);
        assert_eq!(converted[1].urls, vec!["turn:turn.example.org:3478"]);
        assert_eq!(converted[1].username, "u");
    }

    #[test]
    fn candidate_converts_to_engine_init() {
        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host");
        let init: RTCIceCandidateInit = candidate.clone().into();
        assert_eq!(init.sdp_mline_index, Some(0));
        assert_eq!(IceCandidate::from(init), candidate);
    }
}
