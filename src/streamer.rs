//! Viewport streaming: keeps an output buffer filled with the chunks visible
//! through the current viewport.
//!
//! The [`ViewportStreamer`] handle applies viewport changes synchronously and
//! sends a render request to a single worker task. The worker runs at most one
//! render pass at a time. A request that arrives while a pass runs makes it
//! restart with the newest viewport, so only the last requested state is
//! rendered to completion. Fetches for chunks that are still visible in the
//! newer viewport keep running across the restart; the others are cancelled.

use crate::cache::{ChunkCache, LoadTicket};
use crate::config::StreamerConfig;
use crate::downloader::{CancelToken, ChunkStore, FetchError};
use crate::error::{Result, StreamError};
use crate::model::{length_to_mm, ChunkAddress, ChunkKey, Dims3, NonSpatialCoords, PyramidModel};
use crate::viewport::{Viewport, ViewportState};
use futures::future::{BoxFuture, FutureExt};
use fxhash::{FxHashMap, FxHashSet};
use crate::volume::{OutputBuffer, VoxelData, CALIBRATION_SAMPLES};
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};

/// Called whenever new data has been painted into the output buffer.
pub type BufferChangedCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PassState {
    Idle,
    Running,
    RunningWithPendingRestart,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub passes_completed: u64,
    pub chunks_fetched: u64,
    pub chunks_failed: u64,
    pub chunks_cancelled: u64,
    pub cache_len: usize,
    pub loading: usize,
}

#[derive(Default)]
struct Counters {
    passes_completed: AtomicU64,
    fetched: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

enum Request {
    /// Render the current viewport; carries the request's sequence number.
    Render(u64),
    Close,
}

/// What the worker saw on its request channel.
enum Wake {
    Quiet,
    Request(u64),
    Closed,
}

/// Mutable session state, changed by the handle, snapshotted by each pass.
struct Session {
    viewport: Viewport,
    non_spatial: Arc<NonSpatialCoords>,
    slice: Arc<[usize]>,
}

#[derive(derive_more::Debug)]
struct Shared {
    pyramid: PyramidModel,
    pyramid_id: Arc<str>,
    config: StreamerConfig,
    #[debug(skip)]
    store: Arc<dyn ChunkStore>,
    #[debug(skip)]
    cache: Arc<ChunkCache>,
    #[debug(skip)]
    session: Mutex<Session>,
    buffer: Arc<RwLock<OutputBuffer>>,
    #[debug(skip)]
    on_buffer_changed: Option<BufferChangedCallback>,
    state: watch::Sender<PassState>,
    settled: watch::Sender<u64>,
    #[debug(skip)]
    counters: Counters,
}
impl Shared {
    fn notify(&self) {
        if let Some(callback) = &self.on_buffer_changed {
            callback();
        }
    }
    fn set_state(&self, state: PassState) {
        self.state.send_replace(state);
    }
}

/// Read-only access to the output buffer for the display side.
#[derive(Clone)]
pub struct BufferReader(Arc<RwLock<OutputBuffer>>);
impl BufferReader {
    pub fn read(&self) -> RwLockReadGuard<'_, OutputBuffer> {
        self.0.read()
    }
    pub fn dims(&self) -> Dims3 {
        self.0.read().dims()
    }
}

pub struct ViewportStreamer {
    shared: Arc<Shared>,
    requests: mpsc::UnboundedSender<Request>,
    last_request: AtomicU64,
    closed: AtomicBool,
    drag_origin: Mutex<Option<[f64; 3]>>,
}

impl ViewportStreamer {
    /// Fetches the pyramid metadata, centers the viewport on the configured
    /// level and renders it once before returning.
    pub async fn open(
        store: Arc<dyn ChunkStore>,
        config: StreamerConfig,
        on_buffer_changed: Option<BufferChangedCallback>,
    ) -> Result<Self> {
        let pyramid = store.fetch_metadata().await?;
        let level = config.level.min(pyramid.level_count().saturating_sub(1));
        let viewport = Viewport::new(&pyramid, level, config.output_dims_for(&pyramid))?;
        let dtype = pyramid.level_info(level)?.dtype;
        let non_spatial = pyramid.bind_non_spatial(config.channel);
        info!(
            "Streaming {} from level {level} of {}, output {}",
            pyramid.name(),
            pyramid.level_count(),
            viewport.output_dims()
        );

        let (state, _) = watch::channel(PassState::Idle);
        let (settled, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            pyramid_id: Arc::from(pyramid.name()),
            cache: Arc::new(ChunkCache::new(config.cache_size)),
            buffer: Arc::new(RwLock::new(OutputBuffer::new(viewport.output_dims(), dtype))),
            session: Mutex::new(Session {
                viewport,
                slice: non_spatial.values(),
                non_spatial: Arc::new(non_spatial),
            }),
            pyramid,
            config,
            store,
            on_buffer_changed,
            state,
            settled,
            counters: Counters::default(),
        });

        let (requests, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(shared.clone(), receiver));

        let streamer = Self {
            shared,
            requests,
            last_request: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            drag_origin: Mutex::new(None),
        };
        streamer.request_render()?;
        streamer.settled().await?;
        Ok(streamer)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StreamError::StreamClosed)
        } else {
            Ok(())
        }
    }

    fn request_render(&self) -> Result<()> {
        self.ensure_open()?;
        let seq = self.last_request.fetch_add(1, Ordering::AcqRel) + 1;
        self.requests
            .send(Request::Render(seq))
            .map_err(|_| StreamError::StreamClosed)
    }

    fn update_viewport(&self, f: impl FnOnce(&mut Viewport) -> Result<()>) -> Result<()> {
        self.ensure_open()?;
        f(&mut self.shared.session.lock().viewport)?;
        self.request_render()
    }

    /// Pans against a drag of `(dx, dy, dz)` level pixels. Non-finite deltas
    /// are rejected and leave the viewport unchanged.
    pub fn pan_by(&self, dx: f64, dy: f64, dz: f64) -> Result<()> {
        self.update_viewport(|v| v.pan_by(dx, dy, dz))
    }

    /// Centers the viewport on `(x, y, z)`; `z` is kept if `None`.
    pub fn pan_to(&self, x: f64, y: f64, z: Option<f64>) -> Result<()> {
        self.update_viewport(|v| v.pan_to(x, y, z))
    }

    pub fn set_level(&self, level: usize) -> Result<()> {
        self.ensure_open()?;
        let changed = self.shared.session.lock().viewport.set_level(&self.shared.pyramid, level)?;
        if changed {
            debug!("Switching to level {level}");
            self.request_render()?;
        }
        Ok(())
    }

    /// Selects another channel; chunks of other channels stay cached.
    pub fn set_channel(&self, channel: usize) -> Result<()> {
        self.ensure_open()?;
        let coords = self.shared.pyramid.bind_non_spatial(channel);
        {
            let mut session = self.shared.session.lock();
            if *session.non_spatial == coords {
                return Ok(());
            }
            session.slice = coords.values();
            session.non_spatial = Arc::new(coords);
        }
        self.request_render()
    }

    pub fn refresh(&self) -> Result<()> {
        self.request_render()
    }

    pub fn clear_cache(&self) {
        self.shared.cache.clear();
    }

    /// Remembers the current center as the origin for [`Self::drag_to`].
    pub fn begin_drag(&self) {
        *self.drag_origin.lock() = Some(self.shared.session.lock().viewport.center());
    }

    /// Pans by the total drag `(dx, dy, dz)` since [`Self::begin_drag`].
    pub fn drag_to(&self, dx: f64, dy: f64, dz: f64) -> Result<()> {
        let origin = *self.drag_origin.lock();
        self.update_viewport(|v| {
            let [x, y, z] = origin.unwrap_or_else(|| v.center());
            v.set_center([x - dx, y - dy, z - dz])
        })
    }

    pub fn end_drag(&self) {
        *self.drag_origin.lock() = None;
    }

    /// Resolves once every request issued before this call has been rendered.
    pub async fn settled(&self) -> Result<()> {
        let target = self.last_request.load(Ordering::Acquire);
        let mut settled = self.shared.settled.subscribe();
        let seq = *settled
            .wait_for(|&seq| seq >= target)
            .await
            .map_err(|_| StreamError::StreamClosed)?;
        if seq == WORKER_STOPPED {
            return Err(StreamError::StreamClosed);
        }
        self.ensure_open()
    }

    /// Stops the worker, cancels outstanding fetches and drops the cache.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.requests.send(Request::Close);
        self.shared.cache.clear();
        info!("Closed stream of {}", self.shared.pyramid.name());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn pyramid(&self) -> &PyramidModel {
        &self.shared.pyramid
    }

    pub fn viewport_state(&self) -> ViewportState {
        self.shared.session.lock().viewport.state()
    }

    /// A copy of the current viewport geometry.
    pub fn viewport(&self) -> Viewport {
        self.shared.session.lock().viewport.clone()
    }

    pub fn level_dims(&self) -> Dims3 {
        self.shared.session.lock().viewport.level_dims()
    }

    pub fn volume_dims(&self) -> Dims3 {
        self.shared.session.lock().viewport.output_dims()
    }

    pub fn buffer(&self) -> BufferReader {
        BufferReader(self.shared.buffer.clone())
    }

    pub fn cache(&self) -> &ChunkCache {
        &self.shared.cache
    }

    /// Cache key of `address` in the currently selected slice.
    pub fn chunk_key(&self, address: ChunkAddress) -> ChunkKey {
        let slice = self.shared.session.lock().slice.clone();
        ChunkKey::new(self.shared.pyramid_id.clone(), slice, address)
    }

    pub fn pass_state(&self) -> PassState {
        *self.shared.state.borrow()
    }

    pub fn stats(&self) -> StreamStats {
        let counters = &self.shared.counters;
        StreamStats {
            passes_completed: counters.passes_completed.load(Ordering::Relaxed),
            chunks_fetched: counters.fetched.load(Ordering::Relaxed),
            chunks_failed: counters.failed.load(Ordering::Relaxed),
            chunks_cancelled: counters.cancelled.load(Ordering::Relaxed),
            cache_len: self.shared.cache.len(),
            loading: self.shared.cache.loading_count(),
        }
    }

    /// Voxel size of the active level as `[x, y, z]`, in millimetres if
    /// unit conversion is enabled.
    pub fn physical_voxel_size(&self) -> [f64; 3] {
        let level = self.viewport_state().level;
        let pyramid = &self.shared.pyramid;
        let Some(info) = pyramid.levels().get(level) else {
            return [1.0; 3];
        };
        let size = info.voxel_size_xyz();
        if !self.shared.config.convert_units_to_mm {
            return size;
        }
        // units are stored slowest axis first
        let units = pyramid.spatial_units();
        let unit = |axis: usize| units.iter().rev().nth(axis).copied().flatten();
        [
            length_to_mm(size[0], unit(0)),
            length_to_mm(size[1], unit(1)),
            length_to_mm(size[2], unit(2)),
        ]
    }
}

impl Drop for ViewportStreamer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Folds `first` and everything already queued behind it into one wake-up.
fn absorb(first: Option<Request>, requests: &mut mpsc::UnboundedReceiver<Request>) -> Wake {
    let mut wake = Wake::Quiet;
    let mut next = match first {
        Some(request) => Ok(request),
        None => Err(TryRecvError::Disconnected),
    };
    loop {
        match next {
            Ok(Request::Render(seq)) => {
                // senders on other threads may enqueue out of order
                let newest = match wake {
                    Wake::Request(prev) => prev.max(seq),
                    _ => seq,
                };
                wake = Wake::Request(newest);
            }
            Ok(Request::Close) | Err(TryRecvError::Disconnected) => return Wake::Closed,
            Err(TryRecvError::Empty) => return wake,
        }
        next = requests.try_recv();
    }
}

fn drain(requests: &mut mpsc::UnboundedReceiver<Request>) -> Wake {
    match requests.try_recv() {
        Ok(request) => absorb(Some(request), requests),
        Err(TryRecvError::Empty) => Wake::Quiet,
        Err(TryRecvError::Disconnected) => Wake::Closed,
    }
}

/// Gives the host a frame to pile up more requests before a pass starts.
async fn frame_yield(interval: Duration, requests: &mut mpsc::UnboundedReceiver<Request>) -> Wake {
    if interval.is_zero() {
        tokio::task::yield_now().await;
        return drain(requests);
    }
    tokio::select! {
        biased;
        request = requests.recv() => absorb(request, requests),
        _ = tokio::time::sleep(interval) => drain(requests),
    }
}

/// Published as the settled sequence once the worker is gone.
const WORKER_STOPPED: u64 = u64::MAX;

/// Releases `settled` waiters however the worker exits, including a panic in
/// the buffer-changed callback.
struct WorkerExit(Arc<Shared>);
impl Drop for WorkerExit {
    fn drop(&mut self) {
        self.0.set_state(PassState::Idle);
        self.0.settled.send_replace(WORKER_STOPPED);
        debug!("Render worker for {} stopped", self.0.pyramid.name());
    }
}

async fn run_worker(shared: Arc<Shared>, mut requests: mpsc::UnboundedReceiver<Request>) {
    let _exit = WorkerExit(shared.clone());
    let mut inflight = InFlight::default();
    let mut latest = 0;
    'idle: while let Some(request) = requests.recv().await {
        match absorb(Some(request), &mut requests) {
            Wake::Request(seq) => latest = latest.max(seq),
            Wake::Quiet => continue,
            Wake::Closed => break,
        }
        shared.set_state(PassState::Running);
        loop {
            match frame_yield(shared.config.frame_interval(), &mut requests).await {
                Wake::Quiet => {}
                Wake::Request(seq) => {
                    latest = latest.max(seq);
                    continue;
                }
                Wake::Closed => break 'idle,
            }
            shared.set_state(PassState::Running);

            let mut wake = render_pass(&shared, &mut inflight, &mut requests).await;
            if matches!(wake, Wake::Quiet) {
                wake = drain(&mut requests);
            }
            match wake {
                Wake::Quiet => break,
                Wake::Request(seq) => {
                    debug!("Restarting pass for request {seq}, {} fetches carried over", inflight.len());
                    latest = latest.max(seq);
                }
                Wake::Closed => break 'idle,
            }
        }
        shared.counters.passes_completed.fetch_add(1, Ordering::Relaxed);
        shared.set_state(PassState::Idle);
        shared.settled.send_replace(latest);
        debug!("Settled request {latest}");
    }
    inflight.cancel_all();
}

/// Chunk fetches in progress. A fetch outlives the pass that started it for
/// as long as its chunk stays visible.
#[derive(Default)]
struct InFlight {
    fetches: FuturesUnordered<BoxFuture<'static, Fetched>>,
    tokens: FxHashMap<ChunkKey, CancelToken>,
}
impl InFlight {
    fn len(&self) -> usize {
        self.fetches.len()
    }

    /// Starts fetching `key` unless someone else is already loading it.
    fn start(&mut self, shared: &Shared, address: ChunkAddress, key: ChunkKey, non_spatial: &Arc<NonSpatialCoords>) {
        let Some(ticket) = shared.cache.begin_load(key.clone()) else {
            return;
        };
        let token = CancelToken::new();
        self.tokens.insert(key, token.clone());
        let future = fetch(shared.store.clone(), address, non_spatial.clone(), token, ticket);
        self.fetches.push(future.boxed());
    }

    fn finished(&mut self, key: &ChunkKey, token: &CancelToken) {
        if self.tokens.get(key).is_some_and(|t| t.same(token)) {
            self.tokens.remove(key);
        }
    }

    /// Cancels every fetch whose chunk is not in `visible`.
    fn retain_visible(&self, visible: &FxHashSet<ChunkKey>) {
        let mut cancelled = 0;
        for (key, token) in &self.tokens {
            if !visible.contains(key) && !token.is_cancelled() {
                token.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!("Cancelled {cancelled} fetches that left the view");
        }
    }

    fn cancel_all(&self) {
        for token in self.tokens.values() {
            token.cancel();
        }
    }
}

/// What the session shows right now.
struct View {
    viewport: Viewport,
    non_spatial: Arc<NonSpatialCoords>,
    slice: Arc<[usize]>,
}
impl View {
    fn current(shared: &Shared) -> Self {
        let session = shared.session.lock();
        Self {
            viewport: session.viewport.clone(),
            non_spatial: session.non_spatial.clone(),
            slice: session.slice.clone(),
        }
    }

    fn visible(&self, shared: &Shared) -> Vec<(ChunkAddress, ChunkKey)> {
        self.viewport
            .visible_chunks(shared.config.max_visible_chunks)
            .into_iter()
            .map(|address| {
                let key = ChunkKey::new(shared.pyramid_id.clone(), self.slice.clone(), address);
                (address, key)
            })
            .collect()
    }
}

fn key_set(visible: &[(ChunkAddress, ChunkKey)]) -> FxHashSet<ChunkKey> {
    visible.iter().map(|(_, key)| key.clone()).collect()
}

struct Fetched {
    address: ChunkAddress,
    token: CancelToken,
    ticket: LoadTicket,
    result: Result<VoxelData, FetchError>,
}

async fn fetch(
    store: Arc<dyn ChunkStore>,
    address: ChunkAddress,
    non_spatial: Arc<NonSpatialCoords>,
    token: CancelToken,
    ticket: LoadTicket,
) -> Fetched {
    let result = token
        .run(store.fetch_chunk(&address, &non_spatial, &token))
        .await
        .and_then(|r| r);
    Fetched {
        address,
        token,
        ticket,
        result,
    }
}

fn paint_chunk(buffer: &mut OutputBuffer, viewport: &Viewport, address: &ChunkAddress, chunk: &VoxelData) -> bool {
    match viewport.placement(address, chunk.len()) {
        Some(placement) => {
            buffer.calibrate(chunk, CALIBRATION_SAMPLES);
            buffer.paint(&placement, chunk)
        }
        None => false,
    }
}

/// One pass over the viewport as it is now. Returns early news from the
/// request channel, leaving fetches that are still visible in `inflight`.
async fn render_pass(
    shared: &Shared,
    inflight: &mut InFlight,
    requests: &mut mpsc::UnboundedReceiver<Request>,
) -> Wake {
    let view = View::current(shared);
    let viewport = &view.viewport;
    let dtype = match shared.pyramid.level_info(viewport.level()) {
        Ok(info) => info.dtype,
        Err(e) => {
            warn!("Skipping pass: {e}");
            return Wake::Quiet;
        }
    };
    shared.buffer.write().reshape(viewport.output_dims(), dtype);

    let visible = view.visible(shared);
    inflight.retain_visible(&key_set(&visible));
    let mut resident = vec![];
    let mut absent = vec![];
    for (address, key) in visible {
        if let Some(chunk) = shared.cache.get(&key) {
            resident.push((address, chunk));
        } else if !shared.cache.is_loading(&key) {
            absent.push((address, key));
        }
    }
    debug!(
        "Pass at {:?} level {}: {} resident, {} to fetch, {} in flight",
        viewport.center(),
        viewport.level(),
        resident.len(),
        absent.len(),
        inflight.len()
    );

    let painted = {
        let mut buffer = shared.buffer.write();
        resident
            .iter()
            .fold(false, |painted, (address, chunk)| paint_chunk(&mut buffer, viewport, address, chunk) || painted)
    };
    let mut notified = painted;
    if painted {
        shared.notify();
    }

    for (address, key) in absent {
        inflight.start(shared, address, key, &view.non_spatial);
    }

    loop {
        tokio::select! {
            biased;
            request = requests.recv() => {
                let wake = absorb(request, requests);
                match wake {
                    Wake::Request(_) => {
                        let next = View::current(shared);
                        inflight.retain_visible(&key_set(&next.visible(shared)));
                        shared.set_state(PassState::RunningWithPendingRestart);
                    }
                    Wake::Closed => inflight.cancel_all(),
                    Wake::Quiet => {}
                }
                return wake;
            }
            fetched = inflight.fetches.next() => match fetched {
                Some(fetched) => notified |= apply_fetched(shared, inflight, fetched),
                None => break,
            },
        }
    }
    // let the display pick up a pass that only cleared the buffer
    if !notified {
        shared.notify();
    }
    Wake::Quiet
}

/// Caches and paints a finished fetch. Returns whether the buffer changed.
fn apply_fetched(shared: &Shared, inflight: &mut InFlight, fetched: Fetched) -> bool {
    let Fetched {
        address,
        token,
        ticket,
        result,
    } = fetched;
    let key = ticket.key().clone();
    inflight.finished(&key, &token);
    let counters = &shared.counters;
    let data = match result {
        Err(e) if e.is_cancelled() => {
            counters.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!("Fetch of {key} cancelled");
            return false;
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!("Failed to fetch chunk {key}: {e}");
            return false;
        }
        Ok(_) if token.is_cancelled() => {
            counters.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping {key} fetched after cancellation");
            return false;
        }
        Ok(data) => Arc::new(data),
    };
    counters.fetched.fetch_add(1, Ordering::Relaxed);
    shared.cache.set(key.clone(), data.clone());
    // the entry is visible before the loading mark goes away
    drop(ticket);

    // the fetch may have started in an earlier pass, place it in the view as it is now
    let viewport = {
        let session = shared.session.lock();
        if session.viewport.level() != address.level || session.slice != key.slice {
            return false;
        }
        session.viewport.clone()
    };
    let painted = paint_chunk(&mut shared.buffer.write(), &viewport, &address, &data);
    if painted {
        shared.notify();
    }
    painted
}
