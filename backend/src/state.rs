use std::sync::Arc;

use crate::{
    config::Config,
    services::{refresh_store::RefreshTokenStore, session::SessionService},
    utils::{cookies::CookieOptions, jwt::TokenCodec},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub sessions: SessionService,
    pub store: Arc<dyn RefreshTokenStore>,
    pub cookies: CookieOptions,
}

impl AppState {
    pub fn new(config: Config, sessions: SessionService, store: Arc<dyn RefreshTokenStore>) -> Self {
        let cookies = CookieOptions::from_config(&config);
        Self {
            config,
            sessions,
            store,
            cookies,
        }
    }

    /// Codec used by the access-token middleware; shared with the rotation engine.
    pub fn codec(&self) -> &TokenCodec {
        self.sessions.engine().codec()
    }
}
