//! Drives one processor instance, one turn at a time.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::Receiver;
use std::task::Poll;

use crate::errors::{panic_message, prepend_tname, ExecutionError};
use crate::processor::{Inbox, Message, Outbox, Packet, Processor, ProcessorContext};
use crate::window::Watermark;

/// What a turn achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Made,
    Idle,
    Done,
}

/// The receiving end of one inbound ordinal of an instance.
pub(crate) struct InboundOrdinal {
    receiver: Receiver<Packet>,
    /// Per upstream instance.
    done: Vec<bool>,
    remaining: usize,
}

impl InboundOrdinal {
    pub(crate) fn new(receiver: Receiver<Packet>, senders: usize) -> Self {
        Self {
            receiver,
            done: vec![false; senders],
            remaining: senders,
        }
    }

    fn sender_done(&mut self, sender: usize) {
        if let Some(done) = self.done.get_mut(sender) {
            if !*done {
                *done = true;
                self.remaining -= 1;
            }
        }
    }

    fn is_done(&self) -> bool {
        self.remaining == 0
    }
}

/// Tracks the latest watermark of every upstream instance across
/// all ordinals. The instance's watermark is the minimum of them;
/// finished senders no longer hold it back.
#[derive(Debug)]
pub(crate) struct WatermarkCoalescer {
    latest: Vec<Vec<Option<Watermark>>>,
    done: Vec<Vec<bool>>,
    emitted: Option<Watermark>,
}

impl WatermarkCoalescer {
    /// `senders[ordinal]` is the upstream parallelism of that ordinal.
    pub(crate) fn new(senders: &[usize]) -> Self {
        Self {
            latest: senders.iter().map(|n| vec![None; *n]).collect(),
            done: senders.iter().map(|n| vec![false; *n]).collect(),
            emitted: None,
        }
    }

    /// Returns the new coalesced watermark if it advanced.
    pub(crate) fn observe(
        &mut self,
        ordinal: usize,
        sender: usize,
        watermark: Watermark,
    ) -> Option<Watermark> {
        if let Some(slot) = self
            .latest
            .get_mut(ordinal)
            .and_then(|senders| senders.get_mut(sender))
        {
            *slot = Some(slot.map_or(watermark, |last| last.max(watermark)));
        }
        self.advance()
    }

    pub(crate) fn sender_done(&mut self, ordinal: usize, sender: usize) -> Option<Watermark> {
        if let Some(done) = self
            .done
            .get_mut(ordinal)
            .and_then(|senders| senders.get_mut(sender))
        {
            *done = true;
        }
        self.advance()
    }

    /// `None` while some live sender hasn't sent a watermark yet, or
    /// once every sender is done.
    fn current(&self) -> Option<Watermark> {
        let mut min: Option<Watermark> = None;
        let live = self
            .latest
            .iter()
            .flatten()
            .zip(self.done.iter().flatten())
            .filter(|(_, done)| !**done);
        for (latest, _) in live {
            let watermark = (*latest)?;
            min = Some(min.map_or(watermark, |m| m.min(watermark)));
        }
        min
    }

    fn advance(&mut self) -> Option<Watermark> {
        let current = self.current()?;
        if self.emitted.map_or(true, |emitted| current > emitted) {
            self.emitted = Some(current);
            Some(current)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Processing,
    Completing,
    Closing,
    Done,
}

/// A processor instance with its channels.
///
/// Each turn does one thing, in priority order: hand leftover records
/// to the processor, deliver an advanced watermark, complete a
/// finished edge, read a new batch. Once all input is done it calls
/// `complete` until ready, then tells downstream it's done.
pub(crate) struct ProcessorTasklet {
    context: ProcessorContext,
    processor: Box<dyn Processor>,
    inputs: Vec<InboundOrdinal>,
    coalescer: WatermarkCoalescer,
    outbox: Outbox,
    inbox: Inbox,
    inbox_ordinal: usize,
    next_ordinal: usize,
    batch_size: usize,
    pending_watermark: Option<Watermark>,
    edges_to_complete: VecDeque<usize>,
    state: State,
}

impl ProcessorTasklet {
    pub(crate) fn new(
        context: ProcessorContext,
        processor: Box<dyn Processor>,
        inputs: Vec<InboundOrdinal>,
        outbox: Outbox,
        batch_size: usize,
    ) -> Self {
        let senders: Vec<_> = inputs.iter().map(|input| input.done.len()).collect();
        Self {
            context,
            processor,
            coalescer: WatermarkCoalescer::new(&senders),
            inputs,
            outbox,
            inbox: Inbox::new(),
            inbox_ordinal: 0,
            next_ordinal: 0,
            batch_size: batch_size.max(1),
            pending_watermark: None,
            edges_to_complete: VecDeque::new(),
            state: State::Init,
        }
    }

    pub(crate) fn context(&self) -> &ProcessorContext {
        &self.context
    }

    /// Run one turn. Errors and panics of the processor come back as
    /// [`ExecutionError::ProcessorFailed`].
    pub(crate) fn call(&mut self) -> Result<Progress, ExecutionError> {
        match catch_unwind(AssertUnwindSafe(|| self.step())) {
            Ok(Ok(progress)) => Ok(progress),
            Ok(Err(err @ ExecutionError::ProcessorFailed { .. })) => Err(err),
            Ok(Err(err)) => Err(self.failed(err.to_string())),
            Err(payload) => Err(self.failed(panic_message(payload))),
        }
    }

    fn failed(&mut self, message: String) -> ExecutionError {
        self.state = State::Done;
        ExecutionError::ProcessorFailed {
            vertex: self.context.vertex().to_string(),
            instance: self.context.instance(),
            message: prepend_tname(message).trim_end().to_string(),
        }
    }

    fn step(&mut self) -> Result<Progress, ExecutionError> {
        let mut progress = self.outbox.flush();
        match self.state {
            State::Init => {
                self.processor.init(&self.context)?;
                tracing::debug!(
                    vertex = self.context.vertex(),
                    instance = self.context.instance(),
                    "processor initialized"
                );
                self.state = State::Processing;
                progress = true;
            }
            State::Processing => progress |= self.process_inputs()?,
            State::Completing => {
                if self.processor.complete(&mut self.outbox)?.is_ready() {
                    self.outbox.close();
                    self.state = State::Closing;
                    progress = true;
                }
            }
            State::Closing => {
                if self.outbox.is_empty() {
                    tracing::debug!(
                        vertex = self.context.vertex(),
                        instance = self.context.instance(),
                        "processor done"
                    );
                    self.state = State::Done;
                    return Ok(Progress::Done);
                }
            }
            State::Done => return Ok(Progress::Done),
        }
        progress |= self.outbox.take_activity();
        progress |= self.outbox.flush();
        Ok(if progress {
            Progress::Made
        } else {
            Progress::Idle
        })
    }

    fn process_inputs(&mut self) -> Result<bool, ExecutionError> {
        if !self.inbox.is_empty() {
            return self.process_inbox();
        }
        if let Some(watermark) = self.pending_watermark {
            return match self
                .processor
                .try_process_watermark(watermark, &mut self.outbox)?
            {
                Poll::Ready(()) => {
                    tracing::trace!(vertex = self.context.vertex(), %watermark, "watermark processed");
                    self.pending_watermark = None;
                    Ok(true)
                }
                Poll::Pending => Ok(false),
            };
        }
        if let Some(&ordinal) = self.edges_to_complete.front() {
            return match self.processor.complete_edge(ordinal, &mut self.outbox)? {
                Poll::Ready(()) => {
                    tracing::debug!(
                        vertex = self.context.vertex(),
                        instance = self.context.instance(),
                        ordinal,
                        "edge completed"
                    );
                    self.edges_to_complete.pop_front();
                    Ok(true)
                }
                Poll::Pending => Ok(false),
            };
        }
        if self.fill_inbox() {
            if !self.inbox.is_empty() {
                self.process_inbox()?;
            }
            return Ok(true);
        }
        if self.inputs.iter().all(InboundOrdinal::is_done) {
            self.state = State::Completing;
            return Ok(true);
        }
        self.processor.on_idle(&mut self.outbox)?;
        Ok(false)
    }

    fn process_inbox(&mut self) -> Result<bool, ExecutionError> {
        let before = self.inbox.len();
        self.processor
            .process(self.inbox_ordinal, &mut self.inbox, &mut self.outbox)?;
        Ok(self.inbox.len() < before)
    }

    /// Read from the next ordinal that has anything. Returns whether
    /// a message was read.
    fn fill_inbox(&mut self) -> bool {
        let count = self.inputs.len();
        for offset in 0..count {
            let ordinal = (self.next_ordinal + offset) % count;
            if self.read_ordinal(ordinal) {
                self.next_ordinal = (ordinal + 1) % count;
                return true;
            }
        }
        false
    }

    /// Read records up to the batch size, stopping after a control
    /// message so records before it are processed first.
    fn read_ordinal(&mut self, ordinal: usize) -> bool {
        let Some(input) = self.inputs.get_mut(ordinal) else {
            return false;
        };
        let mut read = false;
        while self.inbox.len() < self.batch_size {
            let Ok(packet) = input.receiver.try_recv() else {
                break;
            };
            read = true;
            match packet.message {
                Message::Item(item) => self.inbox.push(item),
                Message::Watermark(watermark) => {
                    if let Some(advanced) = self.coalescer.observe(ordinal, packet.sender, watermark)
                    {
                        self.pending_watermark = Some(advanced);
                    }
                    break;
                }
                Message::Done => {
                    input.sender_done(packet.sender);
                    if let Some(advanced) = self.coalescer.sender_done(ordinal, packet.sender) {
                        self.pending_watermark = Some(advanced);
                    }
                    if input.is_done() {
                        self.edges_to_complete.push_back(ordinal);
                    }
                    break;
                }
            }
        }
        self.inbox_ordinal = ordinal;
        read
    }
}
