use std::path::PathBuf;
use std::sync::Arc;

use anpr_gate::access::AccessResolver;
use anpr_gate::config::GateConfig;
use anpr_gate::events::EventDistributor;
use anpr_gate::plate_detection::dnn_ocr::TesseractReader;
use anpr_gate::plate_detection::object_detector::YoloDetector;
use anpr_gate::plate_detection::pipeline::DetectionPipeline;
use anpr_gate::plate_detection::plate_reader::PlateRecognizer;
use anpr_gate::plate_detection::stream::StreamCompositor;
use anpr_gate::plate_detection::video_reader::OpenCvOpener;
use anpr_gate::server::{router, AppState};
use anpr_gate::service::CameraService;
use anpr_gate::state::GateState;
use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(author, version, about = "License plate access control gate")]
struct Args {
    /// TOML configuration file. Built-in defaults are used without one.
    #[arg(long, env = "ANPR_GATE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to serve HTTP on, overrides `server.listen`.
    #[arg(long)]
    listen: Option<String>,

    /// Camera URL, overrides `camera.url` and `CAMERA_URL`.
    #[arg(long)]
    camera_url: Option<String>,

    /// Camera device index, overrides `camera.index`.
    #[arg(long)]
    camera_index: Option<i32>,

    /// Start capturing immediately, same as `ENABLE_CAMERA=true`.
    #[arg(long)]
    autostart: bool,
}

fn load_config(args: &Args) -> Result<GateConfig> {
    let mut cfg = GateConfig::load(args.config.as_deref())?;
    if let Some(listen) = &args.listen {
        cfg.listen = listen.clone();
    }
    if let Some(url) = &args.camera_url {
        cfg.camera.url = Some(url.clone());
    }
    if let Some(index) = args.camera_index {
        cfg.camera.index = index;
    }
    cfg.autostart |= args.autostart;
    cfg.validate()?;
    Ok(cfg)
}

fn setup(
    cfg: &GateConfig,
    distributor: &EventDistributor,
) -> Result<(Arc<CameraService>, Arc<GateState>)> {
    let state = Arc::new(GateState::default());

    // Both detectors and the OCR engine are loaded once and reused across restarts.
    let vehicle_detector = YoloDetector::vehicle_detector(cfg.vehicle_model()?)
        .context("loading the vehicle detector")?;
    let plate_detector =
        YoloDetector::plate_detector(cfg.plate_model()?).context("loading the plate detector")?;
    let ocr = TesseractReader::new(&cfg.models.tessdata, &cfg.models.language)
        .context("initialising tesseract")?;

    let registry = cfg.registry();
    info!("Vehicle registry holds {} plates", registry.len());

    let pipeline = DetectionPipeline::new(
        Box::new(vehicle_detector),
        Box::new(plate_detector),
        PlateRecognizer::new(Box::new(ocr), cfg.detection.min_crop_height),
        AccessResolver::new(Box::new(registry)),
        distributor.publisher(),
        state.clone(),
        cfg.pipeline_settings(),
    );

    let service = CameraService::new(
        cfg.capture_settings(),
        Arc::new(OpenCvOpener::default()),
        state.clone(),
        pipeline,
    );
    Ok((Arc::new(service), state))
}

async fn shutdown_signal(notify: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl-C: {}", e);
    }
    info!("Shutting down");
    // Open video feeds and websockets end on this, letting the server drain.
    let _ = notify.send(true);
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = load_config(&args)?;

    let distributor = Arc::new(EventDistributor::default());
    distributor
        .start()
        .context("starting the event dispatcher")?;

    let (service, state) = setup(&cfg, &distributor)?;
    if cfg.autostart {
        service.start()?;
    } else {
        info!("Camera disabled at boot, POST /auto-access/start to begin capturing");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let compositor = StreamCompositor::new(state)
        .with_overlay_ttl(cfg.overlay_ttl())
        .with_jpeg_quality(cfg.stream.jpeg_quality);
    let app = router(AppState {
        service: service.clone(),
        distributor: distributor.clone(),
        compositor,
        stream_fps: cfg.stream.fps,
        shutdown: shutdown_rx,
    });

    let addr = cfg.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Serving on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    // Capture first so no event is produced after the dispatcher is gone.
    tokio::task::spawn_blocking(move || {
        service.stop();
        distributor.stop();
    })
    .await?;
    info!("Done");
    Ok(())
}
