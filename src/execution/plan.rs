//! Turning a [`Dag`] into processor instances wired with channels.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;

use super::tasklet::{InboundOrdinal, ProcessorTasklet};
use crate::config::ExecutionConfig;
use crate::errors::{panic_message, ExecutionError, Result};
use crate::pipeline::Dag;
use crate::processor::{Outbox, Packet, Processor, ProcessorContext};
use crate::transform::{Transform, TransformId};

/// Number of instances a transform runs with.
pub(crate) fn parallelism_of(transform: &Transform, config: &ExecutionConfig) -> usize {
    transform
        .local_parallelism()
        .unwrap_or(config.default_parallelism)
}

fn create_processor(
    transform: &Transform,
    context: &ProcessorContext,
) -> Result<Box<dyn Processor>, ExecutionError> {
    catch_unwind(AssertUnwindSafe(|| transform.create_processor(context))).map_err(|payload| {
        ExecutionError::ProcessorFailed {
            vertex: transform.name().to_string(),
            instance: context.instance(),
            message: panic_message(payload),
        }
    })
}

/// One tasklet per instance of every transform.
///
/// Every instance gets one channel per inbound ordinal, shared by all
/// upstream instances of that edge. Every instance's outbox gets one
/// router per outbound edge, sized to the downstream parallelism.
pub(crate) fn plan(
    dag: &Dag,
    config: &ExecutionConfig,
    cancel: &Arc<AtomicBool>,
) -> Result<Vec<ProcessorTasklet>> {
    let parallelism: HashMap<TransformId, usize> = dag
        .transforms()
        .iter()
        .map(|t| (t.id(), parallelism_of(t, config)))
        .collect();
    let parallelism_of_id = |id: TransformId| parallelism.get(&id).copied().unwrap_or(1);

    let mut senders: HashMap<(TransformId, usize), Vec<SyncSender<Packet>>> = HashMap::new();
    let mut inputs: HashMap<(TransformId, usize), Vec<InboundOrdinal>> = HashMap::new();
    for transform in dag.transforms() {
        let id = transform.id();
        let instances = parallelism_of_id(id);
        for edge in dag.inbound(id) {
            let upstream = parallelism_of_id(edge.from());
            let mut edge_senders = Vec::with_capacity(instances);
            for instance in 0..instances {
                let (tx, rx) = sync_channel(config.queue_capacity);
                edge_senders.push(tx);
                inputs
                    .entry((id, instance))
                    .or_default()
                    .push(InboundOrdinal::new(rx, upstream));
            }
            senders.insert((id, edge.ordinal()), edge_senders);
        }
    }

    let mut tasklets = Vec::new();
    for transform in dag.transforms() {
        let id = transform.id();
        let instances = parallelism_of_id(id);
        for instance in 0..instances {
            let context =
                ProcessorContext::with_cancel_flag(transform.name(), instance, instances, cancel.clone());
            let mut outbox = Outbox::new(instance, config.outbox_capacity);
            for edge in dag.outbound(id) {
                let targets = senders
                    .get(&(edge.to(), edge.ordinal()))
                    .cloned()
                    .unwrap_or_default();
                outbox.add_edge(edge.router(targets.len())?, targets);
            }
            let processor = create_processor(transform, &context)?;
            let inbound = inputs.remove(&(id, instance)).unwrap_or_default();
            tasklets.push(ProcessorTasklet::new(
                context,
                processor,
                inbound,
                outbox,
                config.inbox_batch_size,
            ));
        }
        tracing::debug!(vertex = transform.name(), instances, "planned vertex");
    }
    Ok(tasklets)
}
