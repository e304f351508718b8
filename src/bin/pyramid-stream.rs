use anyhow::{bail, Context, Result};
use clap::Parser;
use pyramid_stream::zarr::http::HttpChunkStore;
use pyramid_stream::{StreamerConfig, ViewportStreamer};
use std::sync::Arc;

/// Streams the visible part of an OME-Zarr pyramid into a dense buffer.
#[derive(Parser, Debug, Clone)]
#[command(name = "pyramid-stream", version)]
struct Args {
    /// URL of an OME-Zarr image or a plain zarr array
    url: String,

    /// JSON file with streamer settings
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    level: Option<usize>,

    #[arg(long)]
    channel: Option<usize>,

    /// Output window as WxHxD (or WxH for 2D images)
    #[arg(long)]
    output: Option<String>,

    /// Credentials as user:password for HTTP basic authorization
    #[arg(long)]
    auth: Option<String>,

    /// Center the view on x,y[,z] after opening
    #[arg(long, allow_hyphen_values = true)]
    center: Option<String>,

    /// Drag the view by dx,dy[,dz]; can be given several times
    #[arg(long = "pan", allow_hyphen_values = true)]
    pans: Vec<String>,

    /// Switch to this level after panning
    #[arg(long)]
    switch_level: Option<usize>,

    /// Save the middle slice of the buffer as a grayscale PNG
    #[arg(long)]
    save: Option<String>,
}

fn parse_floats(value: &str) -> Result<Vec<f64>> {
    let values = value
        .split(',')
        .map(|v| v.trim().parse::<f64>().with_context(|| format!("not a number: {v}")))
        .collect::<Result<Vec<_>>>()?;
    if !(2..=3).contains(&values.len()) {
        bail!("expected 2 or 3 comma separated values, got {value}");
    }
    Ok(values)
}

fn parse_dims(value: &str) -> Result<[usize; 3]> {
    let dims = value
        .split('x')
        .map(|v| v.trim().parse::<usize>().with_context(|| format!("not a size: {v}")))
        .collect::<Result<Vec<_>>>()?;
    match dims[..] {
        [w, h] => Ok([w, h, 1]),
        [w, h, d] => Ok([w, h, d]),
        _ => bail!("expected WxH or WxHxD, got {value}"),
    }
}

fn save_slice(streamer: &ViewportStreamer, path: &str) -> Result<()> {
    let reader = streamer.buffer();
    let buffer = reader.read();
    let dims = buffer.dims();
    let z = dims.depth / 2;
    let (lo, hi) = buffer.calibration().map(|c| (c.min, c.max)).unwrap_or((0.0, 1.0));
    let scale = if hi > lo { 255.0 / (hi - lo) } else { 0.0 };

    let mut pixels = Vec::with_capacity(dims.width * dims.height);
    for y in 0..dims.height {
        for x in 0..dims.width {
            let v = buffer.get(x, y, z).unwrap_or(0.0);
            pixels.push(((v - lo) * scale).clamp(0.0, 255.0) as u8);
        }
    }
    let image = image::GrayImage::from_raw(dims.width as u32, dims.height as u32, pixels)
        .context("buffer does not match its dims")?;
    image.save(path).with_context(|| format!("saving {path}"))?;
    println!("Saved slice z={z} to {path}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init(); // Log to stderr (if you run with `RUST_LOG=debug`).
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => StreamerConfig::from_file(path)?,
        None => StreamerConfig::default(),
    };
    if let Some(level) = args.level {
        config.level = level;
    }
    if let Some(channel) = args.channel {
        config.channel = channel;
    }
    if let Some(output) = &args.output {
        config.output_dims = Some(parse_dims(output)?);
    }

    let mut store = HttpChunkStore::new(&args.url);
    if let Some(auth) = &args.auth {
        store = store.with_authorization(auth);
    }
    let streamer = ViewportStreamer::open(Arc::new(store), config, None).await?;
    let pyramid = streamer.pyramid();
    println!(
        "{}: {} levels, {}",
        pyramid.name(),
        pyramid.level_count(),
        if pyramid.is_3d() { "3D" } else { "2D" }
    );
    for level in pyramid.levels() {
        println!(
            "  level {} ({}): {} chunks {:?} {:?}",
            level.index,
            level.path,
            level.dims(),
            level.chunk_shape,
            level.dtype
        );
    }

    if let Some(center) = &args.center {
        let c = parse_floats(center)?;
        streamer.pan_to(c[0], c[1], c.get(2).copied())?;
    }
    for pan in &args.pans {
        let d = parse_floats(pan)?;
        streamer.pan_by(d[0], d[1], d.get(2).copied().unwrap_or(0.0))?;
    }
    if let Some(level) = args.switch_level {
        streamer.set_level(level)?;
    }
    streamer.settled().await?;

    let state = streamer.viewport_state();
    println!(
        "view: level {} center {:?} level dims {} output {} voxel size {:?} mm",
        state.level,
        state.center,
        streamer.level_dims(),
        streamer.volume_dims(),
        streamer.physical_voxel_size()
    );
    if let Some(calibration) = streamer.buffer().read().calibration() {
        println!("range: {} .. {}", calibration.min, calibration.max);
    }
    println!("{:?}", streamer.stats());

    if let Some(path) = &args.save {
        save_slice(&streamer, path)?;
    }
    streamer.close();
    Ok(())
}
