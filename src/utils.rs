use crate::peer::types::ServerConfig;
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Новый идентификатор звонка
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// Добавляет схему протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    const SCHEMES: [&str; 4] = ["turn:", "turns:", "stun:", "stuns:"];
    if SCHEMES.iter().any(|scheme| config.url.starts_with(scheme)) {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}
