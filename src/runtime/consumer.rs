use crate::{packstream::Value, protocol::message::StreamLimit};

use super::{
    context::{RecordStream, StateMachineContext},
    error::SessionError,
};

/// Drives an open record stream on behalf of PULL or DISCARD.
///
/// Consumption stops once `limit` records have been handled or the stream runs dry. The
/// outcome is reported through metadata: `has_more` every time, plus `t_last` and the
/// stream summary once it is exhausted.
pub trait ResultConsumer {
    fn limit(&self) -> StreamLimit;

    /// Handles one record. PULL forwards it, DISCARD drops it.
    fn on_record(
        &mut self,
        ctx: &mut StateMachineContext<'_>,
        fields: Vec<Value>,
    ) -> Result<(), SessionError>;

    /// Returns whether the stream still has records afterwards.
    fn consume(
        &mut self,
        stream: &mut dyn RecordStream,
        ctx: &mut StateMachineContext<'_>,
    ) -> Result<bool, SessionError> {
        let start = ctx.clock().millis();
        let mut handled = 0u64;
        loop {
            if let StreamLimit::Rows(n) = self.limit() {
                if handled >= n {
                    break;
                }
            }
            match stream.next_record()? {
                Some(fields) => {
                    self.on_record(ctx, fields)?;
                    handled += 1;
                }
                None => break,
            }
        }

        let has_more = stream.has_next()?;
        ctx.on_metadata("has_more", has_more);
        if !has_more {
            let elapsed = ctx.clock().millis().saturating_sub(start);
            ctx.on_metadata("t_last", elapsed as i64);
            for (key, value) in stream.summary()? {
                ctx.on_metadata(&key, value);
            }
        }
        Ok(has_more)
    }
}

pub struct PullResultConsumer {
    limit: StreamLimit,
}

impl PullResultConsumer {
    pub fn new(limit: StreamLimit) -> Self {
        Self { limit }
    }
}

impl ResultConsumer for PullResultConsumer {
    fn limit(&self) -> StreamLimit {
        self.limit
    }

    fn on_record(
        &mut self,
        ctx: &mut StateMachineContext<'_>,
        fields: Vec<Value>,
    ) -> Result<(), SessionError> {
        ctx.on_record(fields)
    }
}

pub struct DiscardResultConsumer {
    limit: StreamLimit,
}

impl DiscardResultConsumer {
    pub fn new(limit: StreamLimit) -> Self {
        Self { limit }
    }
}

impl ResultConsumer for DiscardResultConsumer {
    fn limit(&self) -> StreamLimit {
        self.limit
    }

    fn on_record(
        &mut self,
        _ctx: &mut StateMachineContext<'_>,
        _fields: Vec<Value>,
    ) -> Result<(), SessionError> {
        Ok(())
    }
}
