//! Geteilter Zustand aller Sessions eines Gateway-Prozesses

use std::sync::Arc;

use callbridge_admission::AdmissionController;
use callbridge_core::TimelineStore;

use crate::auth::Authenticator;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::limits::CallLimits;
use crate::provider::ProviderSet;
use crate::stats::GatewayStatistik;
use crate::tokens::CallTokens;

/// Wird einmal erstellt und per `Arc` an jede Session gereicht
pub struct GatewayState {
    pub config: GatewayConfig,
    pub auth: Authenticator,
    pub limits: Arc<CallLimits>,
    pub admission: Arc<AdmissionController>,
    /// Geteiltes Token pro Anruf; der letzte Anteil gibt frei
    pub tokens: Arc<CallTokens>,
    pub timeline: TimelineStore,
    pub provider: ProviderSet,
    pub statistik: Arc<GatewayStatistik>,
}

impl GatewayState {
    pub fn neu(
        config: GatewayConfig,
        admission: Arc<AdmissionController>,
        timeline: TimelineStore,
        provider: ProviderSet,
    ) -> GatewayResult<Arc<Self>> {
        config.validieren().map_err(GatewayError::Konfiguration)?;
        let auth = Authenticator::neu(&config.auth)?;
        let limits = CallLimits::neu(
            config.session.max_verbindungen_pro_call,
            config.session.nachrichten_pro_minute,
        );
        let tokens = CallTokens::neu(Arc::clone(&admission));

        tracing::info!(
            auth = ?auth.methoden().iter().map(|m| m.als_str()).collect::<Vec<_>>(),
            provider = ?provider,
            "Gateway-Zustand initialisiert"
        );

        Ok(Arc::new(Self {
            config,
            auth,
            limits,
            admission,
            tokens,
            timeline,
            provider,
            statistik: Arc::new(GatewayStatistik::default()),
        }))
    }
}
