//! Integrationstests: Media-Leg und Session-Uplink gegen ein Schein-Gateway

use std::time::Duration;

use std::time::Instant;

use callbridge_media::{
    AudioFrame, BridgeConfig, JitterBuffer, MediaBridge, MediaError, SessionUplink, UplinkConfig,
};
use callbridge_protocol::{
    signatur, Codec, Frame, FrameCodec, InboundMessage, OutboundMessage, RtpHeader,
    RtpPacket,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio_util::codec::Framed;

const GEHEIMNIS: &str = "test-geheimnis";

type GatewayFramed = Framed<TcpStream, FrameCodec>;

async fn json_lesen(framed: &mut GatewayFramed) -> InboundMessage {
    loop {
        match framed.next().await.unwrap().unwrap() {
            Frame::Json(bytes) => return InboundMessage::parsen(&bytes).unwrap(),
            Frame::Audio { .. } => continue,
            andere => panic!("unerwartet: {andere:?}"),
        }
    }
}

async fn senden(framed: &mut GatewayFramed, nachricht: &OutboundMessage) {
    framed.send(Frame::json(nachricht).unwrap()).await.unwrap();
}

/// Nimmt eine Verbindung an und fuehrt den Handshake wie das Gateway durch
async fn handshake_annehmen(listener: &TcpListener) -> GatewayFramed {
    let (stream, _) = listener.accept().await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());

    match json_lesen(&mut framed).await {
        InboundMessage::Auth {
            call_id,
            timestamp,
            signature,
            options,
            ..
        } => {
            assert!(signatur::pruefen(
                GEHEIMNIS.as_bytes(),
                &call_id,
                timestamp.unwrap(),
                &signature.unwrap()
            ));
            assert_eq!(options.audio_format, Codec::Linear16);
            assert_eq!(options.sample_rate, 8_000);
            senden(
                &mut framed,
                &OutboundMessage::Connected {
                    call_id,
                    session_id: "s1".into(),
                    options,
                },
            )
            .await;
        }
        andere => panic!("auth erwartet, erhalten: {andere:?}"),
    }

    assert!(matches!(
        json_lesen(&mut framed).await,
        InboundMessage::Start { .. }
    ));
    framed
}

async fn audio_lesen(framed: &mut GatewayFramed) -> (u16, u32, Vec<u8>) {
    loop {
        match framed.next().await.unwrap().unwrap() {
            Frame::Audio {
                seq,
                timestamp,
                payload,
            } => return (seq, timestamp, payload.to_vec()),
            Frame::Json(_) => continue,
            andere => panic!("unerwartet: {andere:?}"),
        }
    }
}

fn uplink_config(adresse: String) -> UplinkConfig {
    UplinkConfig {
        gateway_adresse: adresse,
        hmac_geheimnis: GEHEIMNIS.into(),
        backoff_basis_ms: 200,
        ..Default::default()
    }
}

#[tokio::test]
async fn rtp_zum_gateway_und_tts_zurueck() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_adresse = listener.local_addr().unwrap().to_string();

    let bridge = MediaBridge::neu(BridgeConfig {
        bind_adresse: "127.0.0.1:0".parse().unwrap(),
        codec: Codec::Mulaw,
        uplink: uplink_config(gateway_adresse),
        ..Default::default()
    });
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let leg = bridge.leg_starten("c1".into(), shutdown_rx).await.unwrap();

    let mut gateway = handshake_annehmen(&listener).await;

    // Telefonie-Seite sendet ein μ-law Paket (Stille)
    let telefon = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let paket = RtpPacket {
        header: RtpHeader::neu(0, 42, 8_000, 0x1234),
        payload: vec![0xFF; 160],
    };
    telefon
        .send_to(&paket.encode(), leg.lokale_adresse)
        .await
        .unwrap();

    let (seq, timestamp, payload) =
        tokio::time::timeout(Duration::from_secs(2), audio_lesen(&mut gateway))
            .await
            .unwrap();
    assert_eq!((seq, timestamp), (42, 8_000));
    assert_eq!(payload, vec![0u8; 320]);

    // Gateway antwortet mit synthetisiertem Audio
    let tts = OutboundMessage::tts_chunk(1, 0, &[1_000i16; 160], Codec::Linear16, 8_000);
    senden(&mut gateway, &tts).await;

    let mut buf = [0u8; 1500];
    let (laenge, _) = tokio::time::timeout(Duration::from_secs(2), telefon.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let zurueck = RtpPacket::decode(&buf[..laenge]).unwrap();
    assert_eq!(zurueck.header.payload_type, 0);
    assert_eq!(zurueck.payload.len(), 160);

    // Kaputtes Paket wird gezaehlt, der Stream laeuft weiter
    telefon.send_to(&[0u8; 4], leg.lokale_adresse).await.unwrap();

    senden(
        &mut gateway,
        &OutboundMessage::End {
            reason: "completed".into(),
        },
    )
    .await;
    let ergebnis = tokio::time::timeout(Duration::from_secs(2), leg.task)
        .await
        .unwrap()
        .unwrap();
    assert!(ergebnis.is_ok());

    let s = bridge.statistik().snapshot();
    assert_eq!(s.pakete_gesendet, 1);
    assert!(s.pakete_empfangen >= 1);
}

#[tokio::test]
async fn auth_ablehnung_ohne_wiederholung() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let adresse = listener.local_addr().unwrap().to_string();
    let (uplink, _rx) = SessionUplink::starten(uplink_config(adresse), "c2".into());

    let (stream, _) = listener.accept().await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());
    let _auth = json_lesen(&mut framed).await;
    framed
        .send(Frame::close(4001, "auth_failed"))
        .await
        .unwrap();

    let ergebnis = tokio::time::timeout(Duration::from_secs(2), uplink.beenden())
        .await
        .unwrap();
    assert!(matches!(
        ergebnis,
        Err(MediaError::Abgelehnt { code: 4001, .. })
    ));
}

#[tokio::test]
async fn reconnect_liefert_gepuffertes_audio() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let adresse = listener.local_addr().unwrap().to_string();
    let (uplink, _rx) = SessionUplink::starten(uplink_config(adresse), "c3".into());

    // Erste Verbindung: Handshake, dann Abbruch
    let erste = handshake_annehmen(&listener).await;
    drop(erste);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Waehrend der Trennung anfallendes Audio
    for wert in 1..=3i16 {
        let frame = AudioFrame::aus_pcm(wert as u16, 0, Codec::Linear16, 8_000, vec![wert; 160]);
        assert!(uplink.audio_senden(frame));
    }

    let mut zweite = tokio::time::timeout(Duration::from_secs(3), handshake_annehmen(&listener))
        .await
        .unwrap();
    for erwartet in 1..=3i16 {
        let (seq, _, payload) = audio_lesen(&mut zweite).await;
        let sample = i16::from_le_bytes([payload[0], payload[1]]);
        assert_eq!(sample, erwartet);
        assert_eq!(seq, erwartet as u16);
    }

    drop(zweite);
    drop(listener);
    let _ = tokio::time::timeout(Duration::from_secs(10), uplink.beenden()).await;
}

#[tokio::test]
async fn umsortierte_und_fehlende_pakete_erreichen_den_jitter_buffer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_adresse = listener.local_addr().unwrap().to_string();

    let bridge = MediaBridge::neu(BridgeConfig {
        bind_adresse: "127.0.0.1:0".parse().unwrap(),
        codec: Codec::Mulaw,
        uplink: uplink_config(gateway_adresse),
        ..Default::default()
    });
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let leg = bridge.leg_starten("c4".into(), shutdown_rx).await.unwrap();
    let mut gateway = handshake_annehmen(&listener).await;

    // 11 und 10 vertauscht, 12 fehlt
    let telefon = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for seq in [11u16, 10, 13] {
        let paket = RtpPacket {
            header: RtpHeader::neu(0, seq, seq as u32 * 160, 0x1234),
            payload: vec![0x80; 160],
        };
        telefon
            .send_to(&paket.encode(), leg.lokale_adresse)
            .await
            .unwrap();
    }

    let mut empfangen = Vec::new();
    for _ in 0..3 {
        let audio = tokio::time::timeout(Duration::from_secs(2), audio_lesen(&mut gateway))
            .await
            .unwrap();
        empfangen.push(audio);
    }
    let kopf: Vec<(u16, u32)> = empfangen.iter().map(|(s, t, _)| (*s, *t)).collect();
    assert_eq!(kopf, vec![(11, 1_760), (10, 1_600), (13, 2_080)]);

    // Das Gateway sortiert und verdeckt anhand dieser Kopfdaten
    let mut jb = JitterBuffer::standard();
    let t0 = Instant::now();
    for (i, (seq, timestamp, payload)) in empfangen.into_iter().enumerate() {
        let frame =
            AudioFrame::dekodieren(seq, timestamp, Codec::Linear16, 8_000, payload).unwrap();
        jb.push(frame, t0 + Duration::from_millis(i as u64 * 20));
    }
    let spaeter = t0 + Duration::from_secs(2);
    let gespielt: Vec<(u16, bool)> = (0..4)
        .filter_map(|_| jb.pop(spaeter))
        .map(|slot| (slot.frame.seq, slot.concealed))
        .collect();
    assert_eq!(
        gespielt,
        vec![(10, false), (11, false), (12, true), (13, false)]
    );

    senden(
        &mut gateway,
        &OutboundMessage::End {
            reason: "completed".into(),
        },
    )
    .await;
    let _ = tokio::time::timeout(Duration::from_secs(2), leg.task).await;
}
