//! camsource demo: synthetic camera into a capture source, optional rotation

use std::path::PathBuf;
use std::sync::Arc;

use camsource::capture::frame::{MetadataBufferType, PixelFormat};
use camsource::capture::SyntheticCamera;
use camsource::convert::SourceFrame;
use camsource::{
    utils, CameraSource, Config, ReadOptions, RotationConverter, StartOptions, VideoBuffer,
};
use color_eyre::Result;
use flume::bounded;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    // Load configuration
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    utils::init_logging(&config.logging)?;
    camsource::CONFIG.store(Arc::new(config.clone()));

    info!("camsource launching...");

    let camera = Arc::new(SyntheticCamera::new(SyntheticCamera::default_parameters()));
    let source = Arc::new(CameraSource::new(camera.clone(), config.pipeline.clone()));
    source.set_stop_time_us(config.capture.stop_time_us)?;
    source.start(&StartOptions::from(&config.capture))?;

    let format = source.get_format()?;
    info!(
        "Recording {}x{} @ {} fps ({:?})",
        format.width, format.height, format.frame_rate, format.color_format
    );
    camera.spawn_generator(format.frame_rate)?;

    // Reader thread feeds the consumer task
    let (tx, rx) = bounded::<VideoBuffer>(4);
    let reader_source = Arc::clone(&source);
    let reader = tokio::task::spawn_blocking(move || loop {
        match reader_source.read(&ReadOptions::default()) {
            Ok(Some(buffer)) => {
                if tx.send(buffer).is_err() {
                    break;
                }
            }
            Ok(None) => {
                info!("End of stream");
                break;
            }
            Err(e) => {
                error!("Read failed: {}", e);
                break;
            }
        }
    });

    let rotate = config.rotation.enabled
        && source.metadata_buffer_type() == MetadataBufferType::Invalid;
    let mut converter = if rotate {
        Some(RotationConverter::from_config(&config.rotation)?)
    } else {
        None
    };
    let consumer = tokio::spawn(async move {
        let mut frames = 0u64;
        while let Ok(buffer) = rx.recv_async().await {
            frames += 1;
            if let Some(converter) = converter.as_mut() {
                let frame = SourceFrame {
                    data: buffer.data(),
                    width: format.width,
                    height: format.height,
                    stride: format.width,
                    format: PixelFormat::Nv21,
                };
                match converter.convert(&frame) {
                    Ok(Some(rotated)) => debug!(
                        "Frame at {} us rotated to {}x{}",
                        buffer.presentation_time_us(),
                        rotated.width(),
                        rotated.height()
                    ),
                    Ok(None) => debug!("Rotation buffer busy, frame skipped"),
                    Err(e) => warn!("Rotation failed: {}", e),
                }
            }
            // Dropping the buffer hands it back to the source
            drop(buffer);
        }
        frames
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = wait_finished(&reader) => {}
    }

    let stopper = Arc::clone(&source);
    tokio::task::spawn_blocking(move || stopper.stop()).await??;
    reader.await?;
    let frames = consumer.await?;

    let stats = source.stats();
    info!(
        "Consumed {} frames; received/encoded/dropped {}/{}/{}, {} glitches over {}",
        frames,
        stats.received,
        stats.encoded,
        stats.dropped,
        stats.glitches,
        utils::format_us(stats.recorded_duration_us())
    );
    info!("camsource shutting down");
    Ok(())
}

/// Resolves once the reader stops on its own, for a stop time
async fn wait_finished(reader: &tokio::task::JoinHandle<()>) {
    while !reader.is_finished() {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}
