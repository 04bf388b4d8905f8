//! Fixtures shared by the unit tests

use std::cell::RefCell;
use std::collections::VecDeque;

use crate::decode::writer::PayloadWriter;
use crate::request::encode_latin1;
use crate::transport::{Transport, TransportError};

/// Replays canned replies in order and records every request it sees.
pub(crate) struct ScriptedTransport {
    replies: RefCell<VecDeque<Result<Vec<u8>, TransportError>>>,
    requests: RefCell<Vec<String>>,
}

impl ScriptedTransport {
    pub(crate) fn new(
        replies: impl IntoIterator<Item = Result<Vec<u8>, TransportError>>,
    ) -> Self {
        Self {
            replies: RefCell::new(replies.into_iter().collect()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.borrow().clone()
    }
}

impl Transport for ScriptedTransport {
    fn send_request(&self, request: &str) -> Result<Vec<u8>, TransportError> {
        self.requests.borrow_mut().push(request.to_string());
        self.replies
            .borrow_mut()
            .pop_front()
            .unwrap_or(Err(TransportError::ConnectionBroken("script exhausted")))
    }
}

/// Text block with one result set; `body` starts at the column count.
pub(crate) fn text_block(body: &str) -> Vec<u8> {
    let text = format!(
        "1,{}\n-1,463453,756543,-1,3,{body}\n-1,463453,756543,-1\n",
        body.len()
    );
    encode_latin1(&text).unwrap()
}

/// Binary batch: `rows` timestamps from `start_ms`, then `points` linear
/// columns where column `i` holds `first + i * 100, first + i * 100 + 1, ...`
pub(crate) fn value_batch(
    rows: u32,
    start_ms: i64,
    step_ms: i64,
    points: usize,
    first: f64,
) -> Vec<u8> {
    let mut writer = PayloadWriter::new(rows).compressed(points % 2 == 0);
    writer.timestamp_column(start_ms, step_ms);
    for i in 0..points {
        writer.linear_column(first + i as f64 * 100.0, 1.0);
    }
    writer.finish()
}
