//! Mock store-gateway implementations for tests.

use crate::{
    LabelNamesRequest, LabelNamesResponse, LabelValuesRequest, LabelValuesResponse, SeriesChunk,
    SeriesFrame, SeriesFrameStream, SeriesRequest, StoreClientError, StoreClientPool,
    StoreGatewayClient, StreamedSeries,
};
use async_trait::async_trait;
use bytes::Bytes;
use data_types::{BlockId, Label, LabelSet, ReplicaAddr, Timestamp};
use futures::StreamExt;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

/// Scripted behavior of one `series` call.
#[derive(Debug)]
pub enum MockSeriesCall {
    /// Open succeeds and the stream yields these frames in order.
    Respond(Vec<Result<SeriesFrame, StoreClientError>>),
    /// Opening the stream fails.
    FailOpen(StoreClientError),
}

#[derive(Debug, Default)]
struct State {
    series_script: VecDeque<MockSeriesCall>,
    label_names_script: VecDeque<Result<LabelNamesResponse, StoreClientError>>,
    label_values_script: VecDeque<Result<LabelValuesResponse, StoreClientError>>,
    series_requests: Vec<SeriesRequest>,
    label_names_requests: Vec<LabelNamesRequest>,
    label_values_requests: Vec<LabelValuesRequest>,
}

/// A scripted in-memory replica.
///
/// Calls pop scripted responses in FIFO order. With an empty script the mock
/// behaves as a healthy replica holding no data: it hints every requested
/// block and returns nothing else. All received requests are recorded.
#[derive(Debug)]
pub struct MockStoreGateway {
    addr: ReplicaAddr,
    state: Mutex<State>,
}

impl MockStoreGateway {
    /// Create a mock replica listening (notionally) on `addr`.
    pub fn new(addr: impl AsRef<str>) -> Self {
        Self {
            addr: ReplicaAddr::new(addr),
            state: Default::default(),
        }
    }

    /// Script the next `series` call to stream `frames`.
    pub fn push_series(&self, frames: Vec<Result<SeriesFrame, StoreClientError>>) {
        self.state
            .lock()
            .series_script
            .push_back(MockSeriesCall::Respond(frames));
    }

    /// Script the next `series` call to fail on open.
    pub fn push_series_open_error(&self, e: StoreClientError) {
        self.state
            .lock()
            .series_script
            .push_back(MockSeriesCall::FailOpen(e));
    }

    /// Script the next `label_names` call.
    pub fn push_label_names(&self, response: Result<LabelNamesResponse, StoreClientError>) {
        self.state.lock().label_names_script.push_back(response);
    }

    /// Script the next `label_values` call.
    pub fn push_label_values(&self, response: Result<LabelValuesResponse, StoreClientError>) {
        self.state.lock().label_values_script.push_back(response);
    }

    /// All `series` requests received so far.
    pub fn series_requests(&self) -> Vec<SeriesRequest> {
        self.state.lock().series_requests.clone()
    }

    /// All `label_names` requests received so far.
    pub fn label_names_requests(&self) -> Vec<LabelNamesRequest> {
        self.state.lock().label_names_requests.clone()
    }

    /// All `label_values` requests received so far.
    pub fn label_values_requests(&self) -> Vec<LabelValuesRequest> {
        self.state.lock().label_values_requests.clone()
    }
}

#[async_trait]
impl StoreGatewayClient for MockStoreGateway {
    fn addr(&self) -> &ReplicaAddr {
        &self.addr
    }

    async fn series(&self, request: SeriesRequest) -> Result<SeriesFrameStream, StoreClientError> {
        let mut state = self.state.lock();
        state.series_requests.push(request.clone());

        let frames = match state.series_script.pop_front() {
            Some(MockSeriesCall::Respond(frames)) => frames,
            Some(MockSeriesCall::FailOpen(e)) => return Err(e),
            None => vec![Ok(hints_frame(request.block_ids))],
        };
        Ok(futures::stream::iter(frames).boxed())
    }

    async fn label_names(
        &self,
        request: LabelNamesRequest,
    ) -> Result<LabelNamesResponse, StoreClientError> {
        let mut state = self.state.lock();
        state.label_names_requests.push(request.clone());

        match state.label_names_script.pop_front() {
            Some(response) => response,
            None => Ok(LabelNamesResponse {
                queried_blocks: request.block_ids,
                ..Default::default()
            }),
        }
    }

    async fn label_values(
        &self,
        request: LabelValuesRequest,
    ) -> Result<LabelValuesResponse, StoreClientError> {
        let mut state = self.state.lock();
        state.label_values_requests.push(request.clone());

        match state.label_values_script.pop_front() {
            Some(response) => response,
            None => Ok(LabelValuesResponse {
                queried_blocks: request.block_ids,
                ..Default::default()
            }),
        }
    }
}

/// A [`StoreClientPool`] over a fixed set of [`MockStoreGateway`]s.
#[derive(Debug, Default)]
pub struct MockStoreClientPool {
    clients: Mutex<BTreeMap<ReplicaAddr, Arc<MockStoreGateway>>>,
}

impl MockStoreClientPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Default::default()
    }

    /// Register `client`, keyed by its address.
    pub fn register(&self, client: Arc<MockStoreGateway>) {
        self.clients
            .lock()
            .insert(client.addr().clone(), client);
    }
}

#[async_trait]
impl StoreClientPool for MockStoreClientPool {
    async fn client_for(
        &self,
        addr: &ReplicaAddr,
    ) -> Result<Arc<dyn StoreGatewayClient>, StoreClientError> {
        self.clients
            .lock()
            .get(addr)
            .map(|c| Arc::clone(c) as Arc<dyn StoreGatewayClient>)
            .ok_or_else(|| {
                StoreClientError::unavailable(format!("no client registered for {addr}"))
            })
    }
}

/// Build a hints frame listing `queried_blocks`.
pub fn hints_frame(queried_blocks: Vec<BlockId>) -> SeriesFrame {
    SeriesFrame::Hints { queried_blocks }
}

/// Build a series frame from label pairs and chunks.
pub fn series_frame(labels: &[(&str, &str)], chunks: Vec<SeriesChunk>) -> SeriesFrame {
    SeriesFrame::Series(StreamedSeries {
        labels: LabelSet::new(labels.iter().map(|(n, v)| Label::new(*n, *v)).collect()),
        chunks,
    })
}

/// Build a chunk with the given payload.
pub fn chunk(min_time: i64, max_time: i64, payload: &[u8]) -> SeriesChunk {
    SeriesChunk {
        min_time: Timestamp::new(min_time),
        max_time: Timestamp::new(max_time),
        raw: Bytes::copy_from_slice(payload),
    }
}
