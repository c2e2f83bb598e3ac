use anyhow::{Context, bail};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use plane_sink::config::{SinkConfig, app_name, version};
use plane_sink::display::HeadlessDisplay;
use plane_sink::pipeline::{Segment, VideoRect};
use plane_sink::protocol::{ClientMessage, PlaneServer, ServerConnection};
use plane_sink::sink::{PixelLayout, SinkCallbacks, VideoFrame, VideoInfo, VideoSink};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .subcommand_required(true)
        .arg(
            Arg::new("runtime-dir")
                .short('r')
                .long("runtime-dir")
                .value_name("DIR")
                .help("Directory holding the video server socket (defaults to $XDG_RUNTIME_DIR).")
                .global(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON session configuration; environment is used otherwise.")
                .global(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .subcommand(
            Command::new("play")
                .about("Drive a session with synthetic NV12 frames.")
                .arg(
                    Arg::new("frames")
                        .short('n')
                        .long("frames")
                        .default_value("300")
                        .value_parser(value_parser!(u64)),
                )
                .arg(
                    Arg::new("width")
                        .long("width")
                        .default_value("1280")
                        .value_parser(value_parser!(u32)),
                )
                .arg(
                    Arg::new("height")
                        .long("height")
                        .default_value("720")
                        .value_parser(value_parser!(u32)),
                )
                .arg(
                    Arg::new("fps")
                        .long("fps")
                        .default_value("30")
                        .value_parser(value_parser!(f64)),
                )
                .arg(
                    Arg::new("capture-only")
                        .long("capture-only")
                        .help("Never connect to the video server.")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("serve")
                .about("Run a local video server that logs frames and returns buffers.")
                .arg(
                    Arg::new("rate")
                        .long("rate")
                        .default_value("60")
                        .value_parser(value_parser!(u32)),
                ),
        )
        .get_matches();

    let running = Arc::new(AtomicBool::new(true));
    let handler_running = Arc::clone(&running);
    // gracefully close when receiving SIGINT, SIGTERM, or SIGHUP
    ctrlc::set_handler(move || {
        handler_running.store(false, Ordering::SeqCst);
    })
    .context("Error setting Ctrl-C handler")?;

    let config = load_config(&matches)?;

    match matches.subcommand() {
        Some(("play", sub)) => play(config, sub, running),
        Some(("serve", sub)) => serve(config, sub, running),
        _ => bail!("unknown command"),
    }
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<SinkConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => SinkConfig::load_json(path)
            .with_context(|| format!("unable to load configuration from {:?}", path))?,
        None => SinkConfig::from_env(),
    };
    if let Some(dir) = matches.get_one::<PathBuf>("runtime-dir") {
        config = config.with_runtime_dir(dir);
    }
    Ok(config)
}

fn play(config: SinkConfig, args: &ArgMatches, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let frames = *args.get_one::<u64>("frames").context("missing frame count")?;
    let width = *args.get_one::<u32>("width").context("missing width")?;
    let height = *args.get_one::<u32>("height").context("missing height")?;
    let fps = *args.get_one::<f64>("fps").context("missing frame rate")?;
    let capture_only = config.capture_only || args.get_flag("capture-only");
    let config = config.with_capture_only(capture_only);

    let (eos_tx, eos_rx) = mpsc::channel();
    let callbacks = SinkCallbacks::new()
        .with_first_frame(|| log::info!("first frame rendered"))
        .with_first_frame_displayed(|| log::info!("first frame displayed"))
        .with_end_of_stream(move || {
            let _ = eos_tx.send(());
        });

    let display = Arc::new(HeadlessDisplay::new());
    let sink = VideoSink::builder(config)
        .with_display(display.clone())
        .with_callbacks(callbacks)
        .build();

    let info = VideoInfo::new(width, height, PixelLayout::Nv12, fps);
    sink.set_video_info(info);
    sink.set_segment(Segment::default());
    sink.set_video_rectangle(VideoRect::new(0, 0, width as i32, height as i32));
    sink.start().context("unable to start session")?;

    let period = Duration::from_secs_f64(1.0 / info.frame_rate);
    let mut data = vec![0u8; info.frame_size()];
    for i in 0..frames {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        fill_pattern(&mut data, &info, i);
        let pts = i * period.as_nanos() as u64;
        let outcome = sink
            .render(&VideoFrame::new(data.clone(), Some(pts)))
            .context("render failed")?;
        log::trace!("frame {}: {:?}", i, outcome);
        thread::sleep(period);
    }

    sink.eos_event();
    if running.load(Ordering::SeqCst) {
        match eos_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(()) => log::info!("end of stream"),
            Err(_) => log::warn!("no end of stream within 5s"),
        }
    }

    let stats = sink.stats();
    sink.stop().context("unable to stop session")?;
    println!("{}", stats);
    println!("local display attached {} buffers", display.attached());
    Ok(())
}

/// Moving diagonal gradient.
fn fill_pattern(data: &mut [u8], info: &VideoInfo, frame: u64) {
    let stride = info.input_stride();
    let rows = info.height as usize;
    let (luma, chroma) = data.split_at_mut(stride * rows);
    for (y, row) in luma.chunks_mut(stride).enumerate() {
        for (x, px) in row.iter_mut().enumerate() {
            *px = ((x + y) as u64 + frame * 4) as u8;
        }
    }
    chroma.fill(0x80);
}

fn serve(config: SinkConfig, args: &ArgMatches, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let rate = *args.get_one::<u32>("rate").context("missing rate")?;
    let path = config
        .socket_path()
        .context("unable to build the server socket path")?;

    let server = PlaneServer::bind(&path).with_context(|| format!("unable to bind {:?}", path))?;
    server.set_nonblocking(true)?;
    println!("listening on {}", server.path().display());

    let mut sessions = Vec::new();
    while running.load(Ordering::SeqCst) {
        match server.accept()? {
            Some(conn) => {
                let session_running = Arc::clone(&running);
                sessions.push(thread::spawn(move || {
                    if let Err(e) = serve_connection(conn, rate, session_running) {
                        log::error!("connection failed: {:#}", e);
                    }
                }));
            }
            None => thread::sleep(Duration::from_millis(50)),
        }
    }

    for session in sessions {
        let _ = session.join();
    }
    Ok(())
}

/// Keeps the most recent frame "on screen" and returns the one before it.
fn serve_connection(
    mut conn: ServerConnection,
    rate: u32,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    conn.set_read_timeout(Some(Duration::from_millis(100)))?;
    conn.send_rate(rate)?;

    let mut showing: Option<u32> = None;
    let mut frames = 0u64;

    while running.load(Ordering::SeqCst) && !conn.is_closed() {
        for event in conn.poll()? {
            match event.message {
                ClientMessage::Frame(frame) => {
                    frames += 1;
                    log::debug!(
                        "frame {} buffer {} {}x{} time {}us with {} planes",
                        frames,
                        frame.buffer_id,
                        frame.width,
                        frame.height,
                        frame.frame_time,
                        event.fds.len()
                    );
                    if let Some(previous) = showing.replace(frame.buffer_id) {
                        conn.send_release(previous)?;
                    }
                    conn.send_status(frame.frame_time, 0)?;
                }
                ClientMessage::Flush => {
                    log::info!("flush");
                    if let Some(previous) = showing.take() {
                        conn.send_release(previous)?;
                    }
                }
                ClientMessage::Hide(hide) => log::info!("video plane hidden: {}", hide),
                ClientMessage::SessionInfo {
                    sync_type,
                    session_id,
                } => log::info!("session info: sync {} session {}", sync_type, session_id),
            }
        }
    }

    log::info!("connection done after {} frames", frames);
    Ok(())
}
