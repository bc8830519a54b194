//! Control-HTTP-Schnittstelle fuer die Control-Plane
//!
//! - `POST /webhooks/call-status` – Statusmeldung eines Anrufs; `completed`
//!   und `failed` geben das Concurrency-Token frei. Nennt die Meldung eine
//!   Kampagne, muss sie zum Token passen (sonst 409)
//! - `GET /calls/:call_id/timeline` – Ereignisse eines Anrufs in Reihenfolge
//! - `POST /calls/:call_id/media` – oeffnet ein RTP-Leg der Media-Bridge
//!
//! Ist ein API-Key konfiguriert, muss er als `X-Api-Key` oder
//! `Authorization: Bearer` mitgeschickt werden.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use callbridge_admission::AdmissionController;
use callbridge_core::timeline::art;
use callbridge_core::{CallId, CallStatus, CampaignId, TimelineStore};
use callbridge_media::MediaBridge;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;

/// Axum-State der Control-Routen
#[derive(Clone)]
pub struct ControlState {
    pub admission: Arc<AdmissionController>,
    pub timeline: TimelineStore,
    pub bridge: Option<MediaBridge>,
    /// Offene Media-Legs (Call-ID → lokale RTP-Adresse, `None` waehrend des Starts)
    pub legs: Arc<DashMap<String, Option<SocketAddr>>>,
    pub api_key: Option<String>,
    pub shutdown: watch::Receiver<bool>,
}

impl ControlState {
    pub fn neu(
        admission: Arc<AdmissionController>,
        timeline: TimelineStore,
        bridge: Option<MediaBridge>,
        api_key: Option<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            admission,
            timeline,
            bridge,
            legs: Arc::new(DashMap::new()),
            api_key: api_key.filter(|k| !k.is_empty()),
            shutdown,
        }
    }
}

/// Router mit allen Control-Routen
pub fn control_router(state: ControlState) -> Router {
    Router::new()
        .route("/webhooks/call-status", post(call_status))
        .route("/calls/:call_id/timeline", get(call_timeline))
        .route("/calls/:call_id/media", post(media_leg_oeffnen))
        .with_state(state)
}

fn fehler(status: StatusCode, nachricht: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "error": { "code": status.as_u16(), "message": nachricht.into() } })),
    )
        .into_response()
}

fn berechtigung_pruefen(headers: &HeaderMap, state: &ControlState) -> Result<(), Response> {
    let Some(erwartet) = state.api_key.as_deref() else {
        return Ok(());
    };
    let gesendet = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
        });
    match gesendet {
        Some(key) if callbridge_gateway::auth::konstante_zeit_gleich(key, erwartet) => Ok(()),
        Some(_) => Err(fehler(StatusCode::UNAUTHORIZED, "Ungueltiger API-Key")),
        None => Err(fehler(StatusCode::UNAUTHORIZED, "API-Key fehlt")),
    }
}

// ---------------------------------------------------------------------------
// Status-Webhook
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StatusMeldung {
    #[serde(alias = "callSid", alias = "call_id", alias = "callId")]
    pub call_sid: String,
    pub status: CallStatus,
    #[serde(default, alias = "campaignId")]
    pub campaign_id: Option<String>,
}

async fn call_status(
    State(state): State<ControlState>,
    headers: HeaderMap,
    Json(meldung): Json<StatusMeldung>,
) -> Response {
    if let Err(r) = berechtigung_pruefen(&headers, &state) {
        return r;
    }
    if meldung.call_sid.trim().is_empty() {
        return fehler(StatusCode::BAD_REQUEST, "call_sid fehlt");
    }

    // Header hat Vorrang vor dem Body-Feld
    let campaign_id = headers
        .get("x-campaign-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or(meldung.campaign_id);
    let call_id = CallId::neu(meldung.call_sid);
    let status = meldung.status;

    state.timeline.anhaengen(
        &call_id,
        art::CALL_STATUS,
        json!({ "status": status.als_str(), "campaignId": campaign_id }),
    );

    let kampagne = campaign_id
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .map(CampaignId::neu);
    let freigabe = match (status.ist_final(), kampagne) {
        (false, _) => Ok(false),
        (true, Some(kampagne)) => {
            state
                .admission
                .zwangsfreigeben_fuer(&call_id, &kampagne, status.als_str())
        }
        (true, None) => Ok(state.admission.zwangsfreigeben(&call_id, status.als_str())),
    };
    let freigegeben = match freigabe {
        Ok(freigegeben) => freigegeben,
        Err(e) => {
            tracing::warn!(call_id = %call_id, fehler = %e, "Statusmeldung passt nicht zum Token");
            return fehler(StatusCode::CONFLICT, e.to_string());
        }
    };
    tracing::info!(
        call_id = %call_id,
        status = status.als_str(),
        campaign = campaign_id.as_deref().unwrap_or("-"),
        freigegeben,
        "Anrufstatus gemeldet"
    );

    (
        StatusCode::OK,
        Json(json!({
            "callId": call_id.as_str(),
            "status": status.als_str(),
            "released": freigegeben,
        })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

async fn call_timeline(
    State(state): State<ControlState>,
    Path(call_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(r) = berechtigung_pruefen(&headers, &state) {
        return r;
    }
    let events = state.timeline.timeline(&CallId::neu(call_id));
    if events.is_empty() {
        return fehler(StatusCode::NOT_FOUND, "Keine Timeline fuer diesen Anruf");
    }
    (StatusCode::OK, Json(events)).into_response()
}

// ---------------------------------------------------------------------------
// Media-Legs
// ---------------------------------------------------------------------------

async fn media_leg_oeffnen(
    State(state): State<ControlState>,
    Path(call_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(r) = berechtigung_pruefen(&headers, &state) {
        return r;
    }
    let Some(bridge) = state.bridge.as_ref() else {
        return fehler(StatusCode::NOT_FOUND, "Media-Bridge nicht aktiviert");
    };
    let Some(reservierung) = LegReservierung::anlegen(&state.legs, &call_id) else {
        return fehler(StatusCode::CONFLICT, "Leg fuer diesen Anruf existiert bereits");
    };

    let handle = match bridge.leg_starten(call_id.clone(), state.shutdown.clone()).await {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(call_id = %call_id, fehler = %e, "Media-Leg nicht geoeffnet");
            return fehler(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };
    let adresse = handle.lokale_adresse;
    reservierung.belegen(adresse);

    let legs = Arc::clone(&state.legs);
    let id = call_id.clone();
    tokio::spawn(async move {
        match handle.task.await {
            Ok(Ok(())) => tracing::debug!(call_id = %id, "Media-Leg beendet"),
            Ok(Err(e)) => tracing::warn!(call_id = %id, fehler = %e, "Media-Leg mit Fehler beendet"),
            Err(e) => tracing::error!(call_id = %id, fehler = %e, "Media-Leg-Task abgestuerzt"),
        }
        legs.remove(&id);
    });

    (
        StatusCode::CREATED,
        Json(json!({ "callId": call_id, "rtpAddress": adresse.to_string() })),
    )
        .into_response()
}

/// Platz eines Media-Legs, solange es startet; ohne `belegen` wird er beim
/// Drop wieder frei
struct LegReservierung {
    legs: Arc<DashMap<String, Option<SocketAddr>>>,
    call_id: String,
    belegt: bool,
}

impl LegReservierung {
    /// `None` wenn fuer den Anruf schon ein Leg existiert oder startet
    fn anlegen(legs: &Arc<DashMap<String, Option<SocketAddr>>>, call_id: &str) -> Option<Self> {
        match legs.entry(call_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(platz) => {
                platz.insert(None);
                Some(Self {
                    legs: Arc::clone(legs),
                    call_id: call_id.to_string(),
                    belegt: false,
                })
            }
        }
    }

    fn belegen(mut self, adresse: SocketAddr) {
        self.legs.insert(self.call_id.clone(), Some(adresse));
        self.belegt = true;
    }
}

impl Drop for LegReservierung {
    fn drop(&mut self) {
        if !self.belegt {
            self.legs.remove_if(&self.call_id, |_, adresse| adresse.is_none());
        }
    }
}
