//! # intercom-audio - Main Application Entry Point
//!
//! Starts both audio pipelines and the control API:
//!
//! ## Startup order:
//! 1. **Playback output** thread (device kept open for the process lifetime)
//! 2. **Receive pipeline** worker (recorder + decode engine)
//! 3. **Transport** task feeding wire messages to the receive worker
//! 4. **Stream worker** owning the capture/encode-mux engine
//! 5. **HTTP server** with CORS, request tracing and metrics
//!
//! ## Shutdown:
//! On SIGINT/SIGTERM the server stops, the streamer is flushed and closed,
//! the transport disconnects and the receive worker drains its queue.

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use intercom_audio::audio::decoder::DecodeEngine;
use intercom_audio::audio::playback::{playback_channel, spawn_output};
use intercom_audio::audio::receiver::{spawn_receive_worker, ReceivePipeline, ReceiveStats};
use intercom_audio::audio::recorder::SessionRecorder;
use intercom_audio::config::AppConfig;
use intercom_audio::state::{watch_stream_events, AppState, PipelineHandles};
use intercom_audio::stream::{NetworkBackend, StreamController, Streamer};
use intercom_audio::transport::{run_transport, TransportStats};
use intercom_audio::{handlers, health, middleware};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once by the signal handlers.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting intercom-audio v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    // Receive path: transport -> receive worker -> playback output.
    let (playback, playback_rx, playback_stats) = playback_channel(config.playback.queue_capacity);
    let playback_thread = spawn_output(playback_rx, config.playback.sample_rate, playback_stats.clone())?;

    let engine = DecodeEngine::new(
        config.playback.codec,
        config.playback.pcm_sample_rate,
        config.playback.sample_rate,
        Box::new(playback),
    );
    let recorder = SessionRecorder::new(
        config.recording.directory_path(),
        config.playback.codec.file_extension(),
        config.recording.enabled,
    );
    let receive_stats = Arc::new(ReceiveStats::default());
    let (frame_tx, frame_rx) = mpsc::channel(config.transport.queue_capacity);
    let receive_thread = spawn_receive_worker(
        ReceivePipeline::new(recorder, engine, receive_stats.clone()),
        frame_rx,
    )?;

    let transport_stats = Arc::new(TransportStats::default());
    let (transport_shutdown, transport_shutdown_rx) = watch::channel(false);
    let transport_task = if config.transport.enabled {
        Some(tokio::spawn(run_transport(
            config.transport.clone(),
            config.transport.resolve_client_id(),
            frame_tx,
            transport_stats.clone(),
            transport_shutdown_rx,
        )))
    } else {
        info!("Transport disabled, no inbound audio");
        drop(frame_tx);
        None
    };

    // Send path: stream worker, optionally fed by the microphone.
    let backend = NetworkBackend {
        timeout: config.streaming.connect_timeout(),
    };
    let streamer = Streamer::new(
        config.streaming.settings(),
        config.streaming.target(),
        Box::new(backend),
    );
    let (stream_controller, _stream_thread) =
        StreamController::spawn(streamer, config.streaming.queue_capacity)?;

    #[cfg(feature = "device-audio")]
    let _capture = if config.streaming.microphone {
        Some(intercom_audio::audio::capture::spawn_capture(
            stream_controller.clone(),
            config.streaming.capture_sample_rate,
            config.streaming.capture_channels,
        )?)
    } else {
        None
    };
    if cfg!(not(feature = "device-audio")) && config.streaming.microphone {
        warn!("Microphone capture requested but built without the device-audio feature");
    }

    let app_state = AppState::new(
        config.clone(),
        PipelineHandles {
            receive: receive_stats,
            playback: playback_stats,
            transport: transport_stats,
            stream: stream_controller.clone(),
        },
    );
    tokio::spawn(watch_stream_events(app_state.clone(), stream_controller.subscribe()));

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::RequestTelemetry)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/stream/start", web::post().to(handlers::start_stream))
                    .route("/stream/stop", web::post().to(handlers::stop_stream))
                    .route("/stream/status", web::get().to(handlers::stream_status))
                    .route("/stream/pcm", web::post().to(handlers::push_pcm)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    if let Err(e) = stream_controller.stop().await {
        warn!(error = %e, "Stream worker did not stop cleanly");
    }

    let _ = transport_shutdown.send(true);
    if let Some(task) = transport_task {
        if let Err(e) = task.await {
            warn!(error = %e, "Transport task failed");
        }
    }

    // The transport has dropped its sender, so both threads finish on their own.
    let joined = tokio::task::spawn_blocking(move || {
        let receive = receive_thread.join().is_ok();
        let playback = playback_thread.join().is_ok();
        receive && playback
    })
    .await;
    if !matches!(joined, Ok(true)) {
        warn!("Audio worker threads did not exit cleanly");
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Console logging filtered by `RUST_LOG`.
///
/// Defaults to `intercom_audio=debug,actix_web=info` when `RUST_LOG` is unset.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "intercom_audio=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Set [`SHUTDOWN_SIGNAL`] on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll [`SHUTDOWN_SIGNAL`] every 100 ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
