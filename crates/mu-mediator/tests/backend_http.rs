mod common;

use common::fake_backend::{self, PNG};
use mu_mediator::backend::{EnhanceBackend, EnhanceRequest, HttpBackend};
use mu_mediator::error::EnhanceError;
use mu_proto::config::BackendConfig;
use mu_proto::params::{BackendTuning, OutputFormat, QualityTier, TransformParams};

fn client(base_url: String) -> HttpBackend {
    HttpBackend::new(&BackendConfig {
        base_url,
        request_timeout_secs: 5,
        health_timeout_ms: 500,
    })
    .expect("client should initialize")
}

fn request(locator: &str) -> EnhanceRequest {
    EnhanceRequest {
        locator: locator.to_string(),
        params: TransformParams {
            scale: 9,
            quality: QualityTier::Best,
            format: OutputFormat::Webp,
        },
    }
}

#[tokio::test]
async fn enhance_fetchable_locator_uses_get() {
    let (base, seen) = fake_backend::spawn().await;
    let backend = client(base);

    let out = backend
        .enhance(&request("https://cdn.example.com/p1.jpg"))
        .await
        .expect("enhance should succeed");
    assert_eq!(&out.bytes[..], PNG);
    assert_eq!(out.content_type, "image/png");
    assert_eq!(out.model, "esrgan-x2");

    let seen = seen.lock().unwrap();
    let q = &seen.gets[0];
    assert_eq!(q["url"], "https://cdn.example.com/p1.jpg");
    assert_eq!(q["scale"], "4");
    assert_eq!(q["quality"], "best");
    assert_eq!(q["format"], "webp");
}

#[tokio::test]
async fn enhance_inline_source_posts_decoded_body() {
    let (base, seen) = fake_backend::spawn().await;
    let backend = client(base);

    backend
        .enhance(&request("data:image/gif;base64,R0lGODlhAQABAAAAACw="))
        .await
        .expect("enhance should succeed");

    let seen = seen.lock().unwrap();
    assert!(seen.gets.is_empty());
    assert_eq!(seen.posts, vec![("image/gif".to_string(), 14)]);
}

#[tokio::test]
async fn enhance_error_taxonomy() {
    let (base, _seen) = fake_backend::spawn().await;
    let backend = client(base);

    let soft = backend.enhance(&request("https://x.org/soft.jpg")).await;
    assert!(matches!(soft, Err(EnhanceError::HostError(ref m)) if m == "model crashed"));

    let boom = backend.enhance(&request("https://x.org/boom.jpg")).await;
    assert!(matches!(boom, Err(EnhanceError::Transient(_))));

    let missing = backend.enhance(&request("https://x.org/missing.jpg")).await;
    assert!(matches!(missing, Err(EnhanceError::HostError(ref m)) if m.starts_with("404")));

    let empty = backend.enhance(&request("https://x.org/empty.jpg")).await;
    assert!(matches!(empty, Err(EnhanceError::HostError(_))));
}

#[tokio::test]
async fn unreachable_backend_is_transient_and_unhealthy() {
    let backend = client(fake_backend::dead_url().await);
    assert!(!backend.health().await);
    let err = backend
        .enhance(&request("https://x.org/p.jpg"))
        .await
        .expect_err("nothing is listening");
    assert!(matches!(err, EnhanceError::Transient(_)));
}

#[tokio::test]
async fn maintenance_endpoints() {
    let (base, seen) = fake_backend::spawn().await;
    let backend = client(base);

    assert!(backend.health().await);
    backend
        .push_config(&BackendTuning {
            cache_max_bytes: 2 * 1024 * 1024,
            cache_max_age_secs: 24 * 3600,
            extra_models: true,
            idle_shutdown_minutes: 5,
        })
        .await
        .expect("push config");
    backend.clear_cache().await.expect("clear cache");
    backend.download_models(true).await.expect("download models");
    backend.shutdown().await.expect("shutdown");

    let seen = seen.lock().unwrap();
    let cfg = &seen.configs[0];
    assert_eq!(cfg["cache_max_bytes"], 2 * 1024 * 1024);
    assert_eq!(cfg["cache_max_age_secs"], 24 * 3600);
    assert_eq!(cfg["extra_models"], true);
    assert_eq!(cfg["idle_shutdown_minutes"], 5);
    assert_eq!(seen.downloads[0]["extra_tier"], true);
    assert_eq!(seen.cache_clears, 1);
    assert_eq!(seen.shutdowns, 1);
}
