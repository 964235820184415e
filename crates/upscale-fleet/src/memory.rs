//! In-memory fleet, interruption source and agent channel for tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};

use upscale_models::{
    assignment_slot, AgentCommand, AgentReport, Batch, FleetCapacity, InstanceAssignment, InterruptionNotice, JobId,
};

use crate::agent::{AgentChannel, AgentInbox, CommandStream};
use crate::error::{FleetError, FleetResult};
use crate::fleet::ExecutionFleet;
use crate::interruption::{InterruptionSource, NoticeStream};
use crate::queue::{BatchSource, Delivery};

#[derive(Default)]
struct FleetState {
    next_id: u64,
    ready: VecDeque<Delivery<Batch>>,
    /// Delivered but not acknowledged, with delivery time
    pending: HashMap<String, (Delivery<Batch>, Instant)>,
    deliveries: HashMap<String, u32>,
    dead: Vec<(Delivery<Batch>, String)>,
    submitted: Vec<Batch>,
    capacity: HashMap<String, FleetCapacity>,
    /// Instance -> batch slot -> assignment
    assignments: HashMap<String, BTreeMap<String, InstanceAssignment>>,
}

/// Fleet whose batch queue and capacity live in memory.
pub struct MemoryFleet {
    state: Mutex<FleetState>,
    max_deliveries: u32,
}

impl Default for MemoryFleet {
    fn default() -> Self {
        Self {
            state: Mutex::new(FleetState::default()),
            max_deliveries: 3,
        }
    }
}

impl MemoryFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_capacity(&self, fleet_id: &str, fulfilled: u32, target: u32) {
        let mut state = self.lock();
        let entry = state.capacity.entry(fleet_id.to_string()).or_default();
        entry.fulfilled = fulfilled;
        entry.target = target;
    }

    /// Every batch ever submitted, in order.
    pub fn submitted(&self) -> Vec<Batch> {
        self.lock().submitted.clone()
    }

    /// Batches waiting to be delivered.
    pub fn queued(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn dead_letters(&self) -> Vec<(Delivery<Batch>, String)> {
        self.lock().dead.clone()
    }

    /// Take the next queued batch without going through a consumer.
    pub fn pop(&self) -> Option<Delivery<Batch>> {
        let mut state = self.lock();
        let delivery = state.ready.pop_front()?;
        state
            .pending
            .insert(delivery.message_id.clone(), (delivery.clone(), Instant::now()));
        Some(delivery)
    }

    fn lock(&self) -> MutexGuard<'_, FleetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ExecutionFleet for MemoryFleet {
    async fn submit(&self, batch: &Batch) -> FleetResult<String> {
        let mut state = self.lock();
        state.next_id += 1;
        let message_id = format!("{}-0", state.next_id);
        state.submitted.push(batch.clone());
        state.ready.push_back(Delivery {
            message_id: message_id.clone(),
            payload: batch.clone(),
        });
        Ok(message_id)
    }

    async fn describe_capacity(&self, fleet_id: &str) -> FleetResult<FleetCapacity> {
        self.lock()
            .capacity
            .get(fleet_id)
            .copied()
            .ok_or_else(|| FleetError::FleetNotFound(fleet_id.to_string()))
    }

    async fn set_on_demand_target(&self, fleet_id: &str, count: u32) -> FleetResult<()> {
        self.lock()
            .capacity
            .entry(fleet_id.to_string())
            .or_default()
            .on_demand_target = count;
        Ok(())
    }

    async fn assign_instance(&self, assignment: &InstanceAssignment) -> FleetResult<()> {
        self.lock()
            .assignments
            .entry(assignment.instance_id.clone())
            .or_default()
            .insert(assignment.slot(), assignment.clone());
        Ok(())
    }

    async fn release_instance(&self, instance_id: &str, job_id: &JobId, batch_index: u32) -> FleetResult<()> {
        let mut state = self.lock();
        if let Some(slots) = state.assignments.get_mut(instance_id) {
            slots.remove(&assignment_slot(job_id, batch_index));
            if slots.is_empty() {
                state.assignments.remove(instance_id);
            }
        }
        Ok(())
    }

    async fn instance_assignments(&self, instance_id: &str) -> FleetResult<Vec<InstanceAssignment>> {
        let mut assignments: Vec<_> = self
            .lock()
            .assignments
            .get(instance_id)
            .map(|slots| slots.values().cloned().collect())
            .unwrap_or_default();
        assignments.sort_by_key(|a| a.assigned_at);
        Ok(assignments)
    }
}

#[async_trait]
impl BatchSource for MemoryFleet {
    async fn receive(
        &self,
        _consumer: &str,
        block: Duration,
        count: usize,
    ) -> FleetResult<Vec<Delivery<Batch>>> {
        let mut out = Vec::new();
        while out.len() < count {
            match self.pop() {
                Some(delivery) => out.push(delivery),
                None => break,
            }
        }
        if out.is_empty() {
            tokio::time::sleep(block.min(Duration::from_millis(10))).await;
        }
        Ok(out)
    }

    async fn claim_stale(
        &self,
        _consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> FleetResult<Vec<Delivery<Batch>>> {
        let mut state = self.lock();
        let now = Instant::now();
        let mut claimed = Vec::new();
        for (delivery, delivered_at) in state.pending.values_mut() {
            if claimed.len() >= count {
                break;
            }
            if now.duration_since(*delivered_at) >= min_idle {
                *delivered_at = now;
                claimed.push(delivery.clone());
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, message_id: &str) -> FleetResult<()> {
        self.lock().pending.remove(message_id);
        Ok(())
    }

    async fn record_delivery(&self, message_id: &str) -> FleetResult<u32> {
        let mut state = self.lock();
        let count = state.deliveries.entry(message_id.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn dead_letter(&self, delivery: &Delivery<Batch>, error: &str) -> FleetResult<()> {
        let mut state = self.lock();
        state.pending.remove(&delivery.message_id);
        state.dead.push((delivery.clone(), error.to_string()));
        Ok(())
    }

    fn max_deliveries(&self) -> u32 {
        self.max_deliveries
    }
}

/// Interruption source fed by [`MemoryInterruptions::notify`].
pub struct MemoryInterruptions {
    sender: broadcast::Sender<InterruptionNotice>,
}

impl Default for MemoryInterruptions {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }
}

impl MemoryInterruptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a notice to current subscribers.
    pub fn notify(&self, notice: InterruptionNotice) {
        let _ = self.sender.send(notice);
    }
}

#[async_trait]
impl InterruptionSource for MemoryInterruptions {
    async fn subscribe(&self) -> FleetResult<NoticeStream> {
        let receiver = self.sender.subscribe();
        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(notice) => return Some((notice, receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

type Replies = HashMap<String, oneshot::Sender<AgentReport>>;

/// Agent channel connecting controller and agents in one process.
#[derive(Default)]
pub struct MemoryAgentChannel {
    agents: Mutex<HashMap<String, mpsc::UnboundedSender<AgentCommand>>>,
    replies: Mutex<Replies>,
    sent: Mutex<Vec<(String, AgentCommand)>>,
}

impl MemoryAgentChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands sent so far, with their target instance.
    pub fn sent(&self) -> Vec<(String, AgentCommand)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AgentChannel for MemoryAgentChannel {
    async fn send(
        &self,
        instance_id: &str,
        command: AgentCommand,
        timeout: Duration,
    ) -> FleetResult<AgentReport> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((instance_id.to_string(), command.clone()));

        let sender = self
            .agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(instance_id)
            .cloned()
            .ok_or_else(|| FleetError::AgentUnavailable(instance_id.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(command.request_id().to_string(), reply_tx);

        sender
            .send(command)
            .map_err(|_| FleetError::AgentUnavailable(instance_id.to_string()))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(_)) => Err(FleetError::ChannelClosed(instance_id.to_string())),
            Err(_) => Err(FleetError::AgentTimeout {
                instance_id: instance_id.to_string(),
                timeout,
            }),
        }
    }
}

#[async_trait]
impl AgentInbox for MemoryAgentChannel {
    async fn commands(&self, instance_id: &str) -> FleetResult<CommandStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.agents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance_id.to_string(), sender);

        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|command| (command, receiver))
        });
        Ok(Box::pin(stream))
    }

    async fn reply(&self, report: &AgentReport) -> FleetResult<()> {
        let sender = self
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&report.request_id)
            .ok_or_else(|| FleetError::ChannelClosed(report.request_id.clone()))?;
        sender
            .send(report.clone())
            .map_err(|_| FleetError::ChannelClosed(report.request_id.clone()))
    }
}
