use crate::error::{KsplatError, Result};
use crate::selector::{FrameSelector, SelectorConfig, ViewParams};
use crate::tree::SplatTree;
use glam::{Mat4, Vec3};
use log::{debug, info, warn};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Number of depth bins used by the counting sort.
pub const DISTANCE_MAP_RANGE: usize = 1 << 16;

#[derive(Debug, Clone, PartialEq)]
pub struct SortRequest {
    /// Column-major view-projection matrix.
    pub view_proj: [f32; 16],
    pub camera_position: [f32; 3],
    pub visible_count: usize,
    pub sortable_count: usize,
    pub indexes: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SortResponse {
    SetupPhase1Complete,
    SetupComplete,
    SortComplete {
        indexes: Vec<u32>,
        visible_count: usize,
        elapsed: Duration,
    },
    SortCanceled,
}

/// The far side of the sort protocol.
pub trait SortPeer {
    fn send(&mut self, request: SortRequest) -> Result<()>;

    /// Returns the next pending response without blocking.
    fn try_recv(&mut self) -> Result<Option<SortResponse>>;
}

/// Allows at most one request in flight. There is no timeout: a request
/// that never completes keeps the gate closed.
#[derive(Debug, Default)]
pub struct SortGate {
    pending: bool,
}

impl SortGate {
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Returns false if a request is already in flight.
    pub fn try_acquire(&mut self) -> bool {
        !std::mem::replace(&mut self.pending, true)
    }

    pub fn release(&mut self) {
        self.pending = false;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    /// A view direction whose dot with the last sorted one is at or below
    /// this needs a new sort.
    pub direction_threshold: f32,
    /// Camera travel at or beyond this needs a new sort.
    pub distance_threshold: f32,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        RefreshPolicy {
            direction_threshold: 0.95,
            distance_threshold: 1.0,
        }
    }
}

impl RefreshPolicy {
    pub fn needs_refresh(
        &self,
        last_direction: Vec3,
        last_position: Vec3,
        direction: Vec3,
        position: Vec3,
    ) -> bool {
        direction.dot(last_direction) <= self.direction_threshold
            || position.distance(last_position) >= self.distance_threshold
    }
}

/// Everything `SortScheduler` needs to know about the camera for one frame.
#[derive(Debug, Clone, Copy)]
pub struct ViewState {
    pub params: ViewParams,
    pub view_proj: Mat4,
    pub camera_position: Vec3,
    /// Unit world-space view direction.
    pub view_direction: Vec3,
}

/// Drives a `SortPeer` from camera updates and holds the latest draw order.
pub struct SortScheduler<P: SortPeer> {
    peer: P,
    selector: FrameSelector,
    gate: SortGate,
    policy: RefreshPolicy,
    last_direction: Vec3,
    last_position: Vec3,
    ready: bool,
    initial_sort_pending: bool,
    splat_count: usize,
    draw_order: Vec<u32>,
    visible_count: usize,
    last_sort_time: Option<Duration>,
}

impl<P: SortPeer> SortScheduler<P> {
    pub fn new(peer: P, splat_count: usize, selector: SelectorConfig, policy: RefreshPolicy) -> Self {
        SortScheduler {
            peer,
            selector: FrameSelector::new(selector),
            gate: SortGate::default(),
            policy,
            last_direction: Vec3::new(0.0, 0.0, -1.0),
            last_position: Vec3::ZERO,
            ready: false,
            initial_sort_pending: false,
            splat_count,
            draw_order: Vec::new(),
            visible_count: 0,
            last_sort_time: None,
        }
    }

    /// True once the peer reported `SetupComplete`.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_sort_pending(&self) -> bool {
        self.gate.is_pending()
    }

    pub fn draw_order(&self) -> &[u32] {
        &self.draw_order
    }

    pub fn visible_count(&self) -> usize {
        self.visible_count
    }

    pub fn last_sort_time(&self) -> Option<Duration> {
        self.last_sort_time
    }

    pub fn selector(&self) -> &FrameSelector {
        &self.selector
    }

    pub fn peer(&self) -> &P {
        &self.peer
    }

    pub fn peer_mut(&mut self) -> &mut P {
        &mut self.peer
    }

    /// Issues a sort request when the view moved enough (or `force`) and no
    /// request is in flight. Returns whether a request was sent.
    ///
    /// A camera the selector cannot use sends nothing, so the last draw
    /// order stays in place.
    pub fn update_view(
        &mut self,
        tree: &SplatTree,
        view: &ViewState,
        force: bool,
        gather_all: bool,
    ) -> Result<bool> {
        let (force, gather_all) = if self.initial_sort_pending {
            (true, true)
        } else {
            (force, gather_all)
        };
        if !force
            && !self.policy.needs_refresh(
                self.last_direction,
                self.last_position,
                view.view_direction,
                view.camera_position,
            )
        {
            return Ok(false);
        }
        if !self.ready || self.gate.is_pending() {
            return Ok(false);
        }

        if !view.view_proj.is_finite() {
            warn!("Skipping sort, view-projection matrix is not finite");
            return Ok(false);
        }
        let selection = match self.selector.try_select(tree, &view.params, gather_all) {
            Ok(selection) => selection,
            Err(KsplatError::UnsupportedCameraOrInputShape(reason)) => {
                warn!("Skipping sort, keeping the last draw order: {}", reason);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let request = SortRequest {
            view_proj: view.view_proj.to_cols_array(),
            camera_position: view.camera_position.to_array(),
            visible_count: selection.visible_count,
            sortable_count: selection.sortable_count,
            indexes: selection.indexes.clone(),
        };
        debug!(
            "Requesting sort: {} visible, {} sortable",
            request.visible_count, request.sortable_count
        );
        self.peer.send(request)?;
        self.gate.try_acquire();
        self.initial_sort_pending = false;
        self.last_position = view.camera_position;
        self.last_direction = view.view_direction;
        Ok(true)
    }

    /// Drains peer responses. Returns true if the draw order changed.
    pub fn poll(&mut self) -> Result<bool> {
        let mut updated = false;
        while let Some(response) = self.peer.try_recv()? {
            match response {
                SortResponse::SetupPhase1Complete => {
                    info!("Sort peer setup phase 1 complete");
                }
                SortResponse::SetupComplete => {
                    info!("Sort peer ready");
                    self.ready = true;
                    self.initial_sort_pending = true;
                    self.draw_order = (0..self.splat_count as u32).collect();
                    self.visible_count = self.splat_count;
                    updated = true;
                }
                SortResponse::SortComplete {
                    indexes,
                    visible_count,
                    elapsed,
                } => {
                    self.gate.release();
                    self.draw_order = indexes;
                    self.visible_count = visible_count;
                    self.last_sort_time = Some(elapsed);
                    updated = true;
                }
                SortResponse::SortCanceled => {
                    debug!("Sort canceled");
                    self.gate.release();
                }
            }
        }
        Ok(updated)
    }
}

/// Orders `indexes[..sortable_count]` by view depth, ascending, with a
/// counting sort over `DISTANCE_MAP_RANGE` bins. The remainder up to
/// `visible_count` is copied through unchanged.
pub fn sort_indexes(positions: &[f32], request: &SortRequest) -> Result<Vec<u32>> {
    let visible_count = request.visible_count;
    let sortable_count = request.sortable_count;
    let indexes = &request.indexes;
    let view_proj = &request.view_proj;
    let splat_count = positions.len() / 3;
    if sortable_count > visible_count || visible_count > indexes.len() {
        return Err(KsplatError::IndexOutOfRange {
            index: visible_count.max(sortable_count),
            count: indexes.len(),
        });
    }
    if let Some(&bad) = indexes[..visible_count]
        .iter()
        .find(|&&i| i as usize >= splat_count)
    {
        return Err(KsplatError::IndexOutOfRange {
            index: bad as usize,
            count: splat_count,
        });
    }

    let mut out = vec![0u32; visible_count];
    out[sortable_count..].copy_from_slice(&indexes[sortable_count..visible_count]);
    if sortable_count == 0 {
        return Ok(out);
    }

    let depths: Vec<f32> = indexes[..sortable_count]
        .iter()
        .map(|&i| {
            let p = &positions[i as usize * 3..i as usize * 3 + 3];
            view_proj[2] * p[0] + view_proj[6] * p[1] + view_proj[10] * p[2]
        })
        .collect();
    let (min, max) = depths
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &d| (lo.min(d), hi.max(d)));
    let range = max - min;
    let range_map = if range > 0.0 && range.is_finite() {
        (DISTANCE_MAP_RANGE - 1) as f32 / range
    } else {
        0.0
    };
    let bin = |d: f32| (((d - min) * range_map) as usize).min(DISTANCE_MAP_RANGE - 1);

    let mut frequencies = vec![0u32; DISTANCE_MAP_RANGE];
    for &d in &depths {
        frequencies[bin(d)] += 1;
    }
    for i in 1..DISTANCE_MAP_RANGE {
        frequencies[i] += frequencies[i - 1];
    }
    for (i, &d) in depths.iter().enumerate().rev() {
        let b = bin(d);
        frequencies[b] -= 1;
        out[frequencies[b] as usize] = indexes[i];
    }
    Ok(out)
}

/// A `SortPeer` running `sort_indexes` on its own thread.
pub struct ThreadedSorter {
    requests: Option<Sender<SortRequest>>,
    responses: Receiver<SortResponse>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadedSorter {
    /// Spawns the worker with the splat centers as flat `xyz` triples.
    pub fn spawn(positions: Vec<f32>) -> Result<Self> {
        let (request_tx, request_rx) = mpsc::channel::<SortRequest>();
        let (response_tx, response_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("ksplat-sort".to_string())
            .spawn(move || {
                if response_tx.send(SortResponse::SetupPhase1Complete).is_err() {
                    return;
                }
                if response_tx.send(SortResponse::SetupComplete).is_err() {
                    return;
                }
                while let Ok(request) = request_rx.recv() {
                    let start = Instant::now();
                    let response = match sort_indexes(&positions, &request) {
                        Ok(indexes) => SortResponse::SortComplete {
                            indexes,
                            visible_count: request.visible_count,
                            elapsed: start.elapsed(),
                        },
                        Err(e) => {
                            warn!("Canceling sort: {}", e);
                            SortResponse::SortCanceled
                        }
                    };
                    if response_tx.send(response).is_err() {
                        break;
                    }
                }
            })?;

        Ok(ThreadedSorter {
            requests: Some(request_tx),
            responses: response_rx,
            handle: Some(handle),
        })
    }

    /// Blocks for up to `timeout` waiting for the next response.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<SortResponse>> {
        match self.responses.recv_timeout(timeout) {
            Ok(response) => Ok(Some(response)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(KsplatError::SortPeerDisconnected),
        }
    }
}

impl SortPeer for ThreadedSorter {
    fn send(&mut self, request: SortRequest) -> Result<()> {
        self.requests
            .as_ref()
            .ok_or(KsplatError::SortPeerDisconnected)?
            .send(request)
            .map_err(|_| KsplatError::SortPeerDisconnected)
    }

    fn try_recv(&mut self) -> Result<Option<SortResponse>> {
        match self.responses.try_recv() {
            Ok(response) => Ok(Some(response)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(KsplatError::SortPeerDisconnected),
        }
    }
}

impl Drop for ThreadedSorter {
    fn drop(&mut self) {
        self.requests.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
