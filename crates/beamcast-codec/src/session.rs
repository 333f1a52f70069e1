//! The encode session: captured frames in, encoded access units out.
//!
//! One `GstEncodeSession` per streaming session. The GStreamer graph is
//!
//! ```text
//! appsrc (capture caps) → videoconvert → <encoder format caps>
//!   → <encoder> <options…> → <output caps> → <parser> → appsink
//! ```
//!
//! The appsink callback runs on a GStreamer streaming thread and hands
//! packets across to async land through a bounded channel.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSinkCallbacks, AppSrc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use beamcast_core::{CapturedFrame, EncoderError, RawPixelFormat, VideoConfig, VideoPacket};

use crate::descriptor::{Capabilities, CodecSupport, EncoderDescriptor};
use crate::options::{resolve_all, ResolvedValue};

// ── EncodeSession trait ───────────────────────────────────────────────────────

/// Control surface of one encoder instance.
#[async_trait]
pub trait EncodeSession: Send {
    /// Submit a captured frame. Returns the number of packets already
    /// waiting in the output queue, or an error.
    fn convert(&mut self, frame: &CapturedFrame) -> Result<i32, EncoderError>;

    /// The next produced frame must be an IDR.
    fn request_idr_frame(&mut self);

    /// Revert to normal frames.
    fn request_normal_frame(&mut self);

    /// References in `[first, last]` are lost at the decoder. Backends
    /// without native support must refresh with an IDR instead.
    fn invalidate_ref_frames(&mut self, first: i64, last: i64);

    /// Attempt a runtime bitrate change; `true` only if it actually applied.
    fn reconfigure_bitrate(&mut self, _new_kbps: u32) -> bool {
        false
    }

    /// Await the next encoded packet. `None` when the encoder terminated.
    async fn next_packet(&mut self) -> Option<VideoPacket>;

    /// Like `next_packet` with a deadline; used by probing.
    async fn next_packet_timeout(&mut self, timeout: Duration) -> Option<VideoPacket> {
        tokio::time::timeout(timeout, self.next_packet()).await.ok().flatten()
    }
}

// ── GstEncodeSession ──────────────────────────────────────────────────────────

pub struct GstEncodeSession {
    pipeline: gstreamer::Pipeline,
    appsrc: AppSrc,
    encoder_element: gstreamer::Element,
    packet_rx: mpsc::Receiver<VideoPacket>,
    pending: Arc<AtomicI64>,

    frame_duration: gstreamer::ClockTime,
    idr_requested: bool,
    invalidation_pending: bool,
}

impl GstEncodeSession {
    /// Build and start the encode graph for `config` on the given backend.
    /// `input_format` is the capture side's pixel layout; videoconvert
    /// bridges it to the backend's preferred format.
    ///
    /// `gstreamer::init()` must have run first.
    pub fn new(
        descriptor: &EncoderDescriptor,
        codec: &CodecSupport,
        config: &VideoConfig,
        input_format: RawPixelFormat,
    ) -> Result<Self, EncoderError> {
        let raw_format = input_format.caps_name();
        let enc_format = descriptor.pix_fmt_for(config).caps_name();
        let fps = config.fps().round().max(1.0) as u32;
        let options = resolve_all(
            &codec
                .options_for(config)
                .into_iter()
                .cloned()
                .collect::<Vec<_>>(),
            config,
        );
        let props: String = options
            .iter()
            .map(|o| {
                let key = descriptor.kind.map_key(o.name);
                match &o.value {
                    ResolvedValue::Int(v) => format!("{key}={v}"),
                    ResolvedValue::Str(s) => format!("{key}={s}"),
                }
            })
            .collect::<Vec<_>>()
            .join(" ");

        let desc = format!(
            "appsrc name=src is-live=true format=time \
                 caps=\"video/x-raw,format={raw_format},width={width},height={height},\
                        framerate={fps}/1\" \
             ! videoconvert \
             ! video/x-raw,format={enc_format} \
             ! {element} name=enc {props} \
             ! {caps} \
             ! {parser} \
             ! appsink name=sink max-buffers=8 drop=false sync=false emit-signals=false",
            width = config.width,
            height = config.height,
            element = codec.element,
            caps = codec.output_caps,
            parser = codec.parser,
        );
        debug!("Encode graph: {}", desc);

        let pipeline = gstreamer::parse::launch(&desc)
            .map_err(|e| EncoderError::PipelineConstruction { reason: e.to_string() })?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| EncoderError::PipelineConstruction {
                reason: "not a pipeline".into(),
            })?;

        let appsrc: AppSrc = pipeline
            .by_name("src")
            .and_then(|e| e.downcast::<AppSrc>().ok())
            .ok_or_else(|| EncoderError::PipelineConstruction { reason: "missing appsrc".into() })?;
        let appsink: AppSink = pipeline
            .by_name("sink")
            .and_then(|e| e.downcast::<AppSink>().ok())
            .ok_or_else(|| EncoderError::PipelineConstruction { reason: "missing appsink".into() })?;
        let encoder_element = pipeline
            .by_name("enc")
            .ok_or_else(|| EncoderError::PipelineConstruction { reason: "missing encoder".into() })?;

        let (packet_tx, packet_rx) = mpsc::channel::<VideoPacket>(16);
        let pending = Arc::new(AtomicI64::new(0));
        let pending_cb = Arc::clone(&pending);
        let mut frame_index = 0i64;

        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gstreamer::FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(gstreamer::FlowError::Error)?;

                    let idr = !buffer.flags().contains(gstreamer::BufferFlags::DELTA_UNIT);
                    let map = buffer.map_readable().map_err(|_| gstreamer::FlowError::Error)?;
                    let data = Bytes::copy_from_slice(map.as_slice());

                    let packet = VideoPacket::new(data, frame_index, idr);
                    frame_index += 1;

                    pending_cb.fetch_add(1, Ordering::Relaxed);
                    if packet_tx.blocking_send(packet).is_err() {
                        return Err(gstreamer::FlowError::Flushing);
                    }
                    Ok(gstreamer::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| EncoderError::PipelineConstruction { reason: e.to_string() })?;

        info!(
            "Encode session up: {} / {} {}x{}@{}",
            descriptor.name, codec.element, config.width, config.height, fps
        );

        Ok(Self {
            pipeline,
            appsrc,
            encoder_element,
            packet_rx,
            pending,
            frame_duration: gstreamer::ClockTime::from_nseconds(
                (1_000_000_000.0 / config.fps().max(1.0) as f64) as u64,
            ),
            idr_requested: false,
            invalidation_pending: false,
        })
    }

    fn send_force_key_unit(&self) {
        let structure = gstreamer::Structure::builder("GstForceKeyUnit")
            .field("all-headers", true)
            .build();
        if !self.pipeline.send_event(gstreamer::event::CustomUpstream::new(structure)) {
            warn!("Force-key-unit event was not handled");
        }
    }
}

#[async_trait]
impl EncodeSession for GstEncodeSession {
    fn convert(&mut self, frame: &CapturedFrame) -> Result<i32, EncoderError> {
        if self.idr_requested {
            self.send_force_key_unit();
        }

        let mut buffer = gstreamer::Buffer::with_size(frame.data.len())
            .map_err(|e| EncoderError::SubmitFailed { reason: e.to_string() })?;
        {
            let buffer_mut = buffer.get_mut().unwrap();
            buffer_mut.set_pts(gstreamer::ClockTime::from_nseconds(
                self.frame_duration.nseconds() * frame.frame_number,
            ));
            buffer_mut.set_duration(self.frame_duration);
            let mut map = buffer_mut
                .map_writable()
                .map_err(|_| EncoderError::SubmitFailed { reason: "map failed".into() })?;
            map.copy_from_slice(&frame.data);
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| EncoderError::SubmitFailed { reason: format!("{e:?}") })?;

        Ok(self.pending.load(Ordering::Relaxed).max(0) as i32)
    }

    fn request_idr_frame(&mut self) {
        self.idr_requested = true;
    }

    fn request_normal_frame(&mut self) {
        self.idr_requested = false;
    }

    fn invalidate_ref_frames(&mut self, first: i64, last: i64) {
        // No GStreamer backend exposes selective reference invalidation;
        // refresh with an IDR instead.
        debug!("Invalidating refs [{}, {}] via IDR", first, last);
        self.invalidation_pending = true;
        self.request_idr_frame();
    }

    fn reconfigure_bitrate(&mut self, new_kbps: u32) -> bool {
        let Some(pspec) = self.encoder_element.find_property("bitrate") else {
            return false;
        };
        // The common encoders take kbps as a uint; a few take int.
        if pspec.value_type() == u32::static_type() {
            self.encoder_element.set_property("bitrate", new_kbps);
        } else if pspec.value_type() == i32::static_type() {
            self.encoder_element.set_property("bitrate", new_kbps as i32);
        } else {
            return false;
        }
        info!("Encoder bitrate reconfigured to {} kbps", new_kbps);
        true
    }

    async fn next_packet(&mut self) -> Option<VideoPacket> {
        let mut packet = self.packet_rx.recv().await?;
        self.pending.fetch_sub(1, Ordering::Relaxed);
        if packet.idr {
            self.idr_requested = false;
        }
        if self.invalidation_pending && packet.idr {
            packet.after_ref_frame_invalidation = true;
            self.invalidation_pending = false;
        }
        Some(packet)
    }
}

impl Drop for GstEncodeSession {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

/// Probe helper: does this element expose a property at all?
pub(crate) fn element_has_property(element_name: &str, property: &str) -> bool {
    let Some(factory) = gstreamer::ElementFactory::find(element_name) else {
        return false;
    };
    let Ok(element) = factory.create().build() else {
        return false;
    };
    element.find_property(property).is_some()
}
