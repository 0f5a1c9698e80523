#![cfg(unix)]

use std::time::{Duration, Instant};

use iptv_scan_rs::inspector::{InspectorConfig, ProbeHeaders};
use iptv_scan_rs::probe::{check_reachable, Prober, StreamProbe};
use iptv_scan_rs::types::ErrorKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const HD_JSON: &str = r#"{"programs":[{"tags":{"service_name":"News-HD"}}],"streams":[{"codec_type":"video","codec_name":"h264","width":1920,"height":1080,"bit_rate":"6000000"}]}"#;

/// An inspector that runs `script` under `sh`; the generated ffprobe
/// arguments land in the script's positional parameters and are ignored.
fn sh_probe(script: &str) -> StreamProbe {
    let cfg = InspectorConfig {
        program: "sh".into(),
        leading_args: vec!["-c".into(), script.into(), "sh".into()],
        ..InspectorConfig::default()
    };
    StreamProbe::new(cfg, ProbeHeaders::default())
}

fn print_json(json: &str) -> String {
    format!("printf '%s' '{json}'")
}

#[tokio::test]
async fn inspector_json_makes_result_valid() {
    let probe = sh_probe(&print_json(HD_JSON));
    let r = probe
        .probe("udp://239.1.1.1:5000", Duration::from_secs(5), &CancellationToken::new())
        .await;
    assert!(r.valid, "{r:?}");
    assert_eq!(r.resolution.as_deref(), Some("1920x1080"));
    assert_eq!(r.codec.as_deref(), Some("h264"));
    assert_eq!(r.bitrate.as_deref(), Some("6000000"));
    assert_eq!(r.raw_service_name.as_deref(), Some("News"));
    assert!(r.error.is_none());
}

#[tokio::test]
async fn inspector_timeout_is_invalid_with_timeout_latency() {
    let probe = sh_probe("sleep 5");
    let start = Instant::now();
    let r = probe
        .probe("rtp://239.1.1.1:5000", Duration::from_secs(1), &CancellationToken::new())
        .await;
    assert!(!r.valid);
    assert!(r.error.as_deref().unwrap_or_default().contains("timeout"), "{r:?}");
    assert_eq!(r.error_kind, Some(ErrorKind::Timeout));
    let latency = r.latency_ms.unwrap();
    assert!((900..2500).contains(&latency), "latency {latency}");
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn multicast_recovers_resolution_from_diagnostics() {
    let probe = sh_probe("echo 'Stream #0:0: Video: h264, yuv420p, 1280x720, 25 fps' >&2; exit 1");
    let r = probe
        .probe("udp://239.1.1.1:5000", Duration::from_secs(5), &CancellationToken::new())
        .await;
    assert!(r.valid, "{r:?}");
    assert_eq!(r.resolution.as_deref(), Some("1280x720"));
}

#[tokio::test]
async fn inspector_failure_reports_stderr_or_exit_code() {
    let r = sh_probe("echo 'Connection refused' >&2; exit 1")
        .probe("udp://239.1.1.1:5000", Duration::from_secs(5), &CancellationToken::new())
        .await;
    assert!(!r.valid);
    assert_eq!(r.error.as_deref(), Some("Connection refused"));
    assert_eq!(r.error_kind, Some(ErrorKind::Connection));

    let r = sh_probe("exit 3")
        .probe("udp://239.1.1.1:5000", Duration::from_secs(5), &CancellationToken::new())
        .await;
    assert_eq!(r.error.as_deref(), Some("inspector exited with code 3"));
}

#[tokio::test]
async fn malformed_output_is_parse_error() {
    let r = sh_probe("echo 'not json'")
        .probe("udp://239.1.1.1:5000", Duration::from_secs(5), &CancellationToken::new())
        .await;
    assert!(!r.valid);
    assert!(r.error.unwrap().contains("unparsable"));
}

#[tokio::test]
async fn cancellation_kills_the_inspector() {
    let probe = sh_probe("sleep 30");
    let cancel = CancellationToken::new();
    let c = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        c.cancel();
    });
    let start = Instant::now();
    let r = probe
        .probe("udp://239.1.1.1:5000", Duration::from_secs(30), &cancel)
        .await;
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(!r.valid);
    assert_eq!(r.error_kind, Some(ErrorKind::Cancelled));
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Serve one canned response per connection.
async fn http_stub(response: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            let _ = sock.write_all(response.as_bytes()).await;
        }
    });
    port
}

#[tokio::test]
async fn unreachable_unicast_skips_inspector() {
    let port = closed_port().await;
    // The inspector would report a valid stream if it ran.
    let probe = sh_probe(&print_json(HD_JSON));
    let r = probe
        .probe(
            &format!("http://127.0.0.1:{port}/live/1.ts"),
            Duration::from_secs(2),
            &CancellationToken::new(),
        )
        .await;
    assert!(!r.valid);
    assert!(r.error.unwrap().contains("unreachable"));
    assert_eq!(r.error_kind, Some(ErrorKind::Connection));
}

#[tokio::test]
async fn reachable_unicast_runs_inspector() {
    let port = http_stub("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
    let probe = sh_probe(&print_json(HD_JSON));
    let r = probe
        .probe(
            &format!("http://127.0.0.1:{port}/live/1.ts"),
            Duration::from_secs(4),
            &CancellationToken::new(),
        )
        .await;
    assert!(r.valid, "{r:?}");
    assert_eq!(r.resolution.as_deref(), Some("1920x1080"));
}

#[tokio::test]
async fn head_not_found_is_unreachable() {
    let port = http_stub("HTTP/1.1 404 Not Found\r\n\r\n").await;
    let err = check_reachable(
        &format!("http://127.0.0.1:{port}/gone.ts"),
        Duration::from_secs(2),
        &ProbeHeaders::default(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("404"));
}

#[tokio::test]
async fn raw_connect_for_non_http_schemes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let ok = check_reachable(
        &format!("rtmp://127.0.0.1:{port}/live/x"),
        Duration::from_secs(2),
        &ProbeHeaders::default(),
    )
    .await;
    assert!(ok.is_ok());
    drop(listener);
}

/// HTTPS stub with a self-signed certificate issued for another host name.
async fn tls_stub(response: &'static str) -> u16 {
    let identity = native_tls::Identity::from_pkcs8(
        include_bytes!("fixtures/selfsigned.crt"),
        include_bytes!("fixtures/selfsigned.key"),
    )
    .unwrap();
    let acceptor = tokio_native_tls::TlsAcceptor::from(native_tls::TlsAcceptor::new(identity).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((sock, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(mut tls) = acceptor.accept(sock).await {
                    let mut buf = [0u8; 1024];
                    let _ = tls.read(&mut buf).await;
                    let _ = tls.write_all(response.as_bytes()).await;
                    let _ = tls.shutdown().await;
                }
            });
        }
    });
    port
}

#[tokio::test]
async fn https_with_self_signed_certificate_is_reachable() {
    let port = tls_stub("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
    let res = check_reachable(
        &format!("https://127.0.0.1:{port}/live/1.ts"),
        Duration::from_secs(2),
        &ProbeHeaders::default(),
    )
    .await;
    assert!(res.is_ok(), "{res:?}");
}

#[tokio::test]
async fn status_line_split_across_writes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            let _ = sock.write_all(b"HTTP/1.1").await;
            let _ = sock.flush().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = sock.write_all(b" 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        }
    });

    let res = check_reachable(
        &format!("http://127.0.0.1:{port}/live/1.ts"),
        Duration::from_secs(2),
        &ProbeHeaders::default(),
    )
    .await;
    assert!(res.is_ok(), "{res:?}");
}

#[tokio::test]
async fn unicast_inspector_timeout_reports_full_budget() {
    let port = http_stub("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
    let r = sh_probe("sleep 5")
        .probe(
            &format!("http://127.0.0.1:{port}/live/1.ts"),
            Duration::from_secs(2),
            &CancellationToken::new(),
        )
        .await;
    assert!(!r.valid);
    assert_eq!(r.error.as_deref(), Some("probe timeout after 2s"));
    assert_eq!(r.error_kind, Some(ErrorKind::Timeout));
}
