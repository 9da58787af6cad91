//! Step orchestrator — drives one run through its lifecycle.
//!
//! `Starting → Stepping(k)* → Completing → Done`, with `Erroring`
//! reachable from any step. Each step renders a prompt from working
//! memory, streams the model response through the assembler, dispatches
//! completed elements, settles scheduled tool calls in completion order,
//! then flushes memory and state before deciding whether to continue.
//!
//! Mid-run external events arrive through the registry's input channel and
//! are folded in at the next step boundary; there is never a second
//! orchestrator for the same conversation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use metrics::{counter, histogram};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use strand_core::errors::EngineError;
use strand_core::ids::{ConversationId, RunId};
use strand_core::logs::{Log, LogMeta};
use strand_core::memory::WorkingMemory;
use strand_llm::{GenerateRequest, ModelProvider, StreamEvent};

use crate::assembler::{ElementEvent, StreamAssembler, THOUGHT_TAG};
use crate::builder::Registries;
use crate::context::{ContextManager, ConversationState};
use crate::contracts::{Conversation, ErrorDisposition, RunContext, SpecRole, ToolSpec};
use crate::events::{BaseEvent, EngineEvent, EventEmitter};
use crate::registry::{RunRegistry, StartedRun};
use crate::resolver::resolve_references;
use crate::scheduler::{Priority, SchedulerError, TaskOptions, TaskScheduler};

/// Extra model-call attempts after a stream failure.
const MODEL_RETRIES: u32 = 1;

/// What a completed run hands back to the caller that drove it.
#[derive(Clone, Debug)]
pub struct RunResult {
    /// Run id.
    pub run_id: RunId,
    /// Conversation the run belonged to.
    pub conversation_id: ConversationId,
    /// Steps executed (including error-recovered ones).
    pub steps: u32,
    /// Final working-memory contents, in order.
    pub logs: Vec<Log>,
}

struct ToolTask {
    name: String,
    call_id: String,
    elapsed_ms: u64,
    result: Result<crate::scheduler::TaskOutcome<Value>, SchedulerError>,
}

/// Drives runs. One orchestrator per engine, shared across runs.
pub(crate) struct StepOrchestrator {
    registries: Arc<Registries>,
    provider: Arc<dyn ModelProvider>,
    scheduler: Arc<TaskScheduler>,
    context: Arc<ContextManager>,
    registry: Arc<RunRegistry>,
    emitter: Arc<EventEmitter>,
}

impl StepOrchestrator {
    pub(crate) fn new(
        registries: Arc<Registries>,
        provider: Arc<dyn ModelProvider>,
        scheduler: Arc<TaskScheduler>,
        context: Arc<ContextManager>,
        registry: Arc<RunRegistry>,
        emitter: Arc<EventEmitter>,
    ) -> Self {
        Self {
            registries,
            provider,
            scheduler,
            context,
            registry,
            emitter,
        }
    }

    /// Drive a freshly started run to completion.
    #[instrument(skip_all, fields(conversation_id = %state.id, run_id = %started.run_id))]
    pub(crate) async fn run(
        &self,
        def: Arc<dyn Conversation>,
        mut state: ConversationState,
        started: StartedRun,
    ) -> Result<RunResult, crate::errors::RuntimeError> {
        let StartedRun {
            run_id,
            cancel,
            mut input_rx,
        } = started;
        let conversation_id = state.id.clone();

        let mut memory = match self.context.load_memory(&conversation_id).await {
            Ok(snapshot) => snapshot.unwrap_or_default(),
            Err(e) => {
                let _ = self.registry.complete(conversation_id.as_str());
                return Err(e);
            }
        };

        let _ = self.emitter.emit(EngineEvent::RunStart {
            base: BaseEvent::now(conversation_id.as_str()),
            run_id: run_id.to_string(),
        });

        let max_steps = state.settings.max_steps;
        let mut steps_executed = 0;
        let mut step = 0;
        while step < max_steps {
            let step_result = self
                .close_step(
                    &def,
                    &mut state,
                    &mut memory,
                    &mut input_rx,
                    step,
                    &run_id,
                    &cancel,
                )
                .await;
            steps_executed = step + 1;

            if let Err(err) = step_result {
                // A user-requested abort is normal shutdown, not a failure.
                if matches!(err, EngineError::Cancelled) {
                    debug!(step, "run cancelled");
                    break;
                }
                error!(step, error = %err, "step failed");
                let _ = self.emitter.emit(EngineEvent::RunError {
                    base: BaseEvent::now(conversation_id.as_str()),
                    run_id: run_id.to_string(),
                    error: err.to_string(),
                });
                // Partial progress is always flushed before the hook runs.
                if let Err(e) = self.context.flush_memory(&conversation_id, &memory).await {
                    warn!(error = %e, "memory flush failed during error handling");
                }
                let disposition = def.on_error(&mut state, &err).await;
                if let Err(e) = self.context.persist(&state).await {
                    warn!(error = %e, "state persist failed during error handling");
                }
                match disposition {
                    ErrorDisposition::Recover => {
                        debug!(step, "conversation chose to recover");
                    }
                    ErrorDisposition::Abort => break,
                }
            }

            if cancel.is_cancelled() {
                debug!(step, "run cancelled");
                break;
            }
            step += 1;
            if step >= max_steps {
                debug!(max_steps, "step ceiling reached");
                break;
            }
            // Events joined since the last step-boundary drain count as
            // pending input for the continuation decision.
            while let Ok(event) = input_rx.try_recv() {
                memory.push_input(event);
            }
            if !def.should_continue(&memory) {
                break;
            }
        }

        // Completing: everything folded, hooks, final flush, deregister.
        memory.mark_all_processed();
        // Events joined during the final step were acknowledged with a
        // `Joined` outcome; fold them in unprocessed so they survive into
        // the conversation's next run instead of vanishing with the
        // channel.
        while let Ok(event) = input_rx.try_recv() {
            memory.push_input(event);
        }
        let leftover = memory.drain_inputs();
        if leftover > 0 {
            debug!(leftover, "undispatched events carried past run end");
        }
        if let Err(e) = def.on_run(&mut state, &memory).await {
            warn!(error = %e, "on_run hook failed");
        }
        let flush = self.context.flush_memory(&conversation_id, &memory).await;
        let persist = self.context.persist(&state).await;
        let _ = self.registry.complete(conversation_id.as_str());
        flush?;
        persist?;

        let _ = self.emitter.emit(EngineEvent::RunEnd {
            base: BaseEvent::now(conversation_id.as_str()),
            run_id: run_id.to_string(),
            steps: steps_executed,
            log_count: memory.len(),
        });
        Ok(RunResult {
            run_id,
            conversation_id,
            steps: steps_executed,
            logs: memory.logs().to_vec(),
        })
    }

    /// Execute one step and close it out (flush, hooks, persist).
    async fn close_step(
        &self,
        def: &Arc<dyn Conversation>,
        state: &mut ConversationState,
        memory: &mut WorkingMemory,
        input_rx: &mut mpsc::UnboundedReceiver<Log>,
        step: u32,
        run_id: &RunId,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.execute_step(def, state, memory, input_rx, step, run_id, cancel)
            .await?;

        memory.mark_all_processed();
        let flush = self.context.flush_memory(&state.id, memory).await;
        if let Err(e) = def.on_step(state, memory, step).await {
            warn!(step, error = %e, "on_step hook failed");
        }
        let persist = self.context.persist(state).await;
        let _ = self.emitter.emit(EngineEvent::StepEnd {
            base: BaseEvent::now(state.id.as_str()),
            run_id: run_id.to_string(),
            step,
        });
        flush
            .and(persist)
            .map_err(|e| EngineError::Store(e.to_string()))
    }

    async fn execute_step(
        &self,
        def: &Arc<dyn Conversation>,
        state: &mut ConversationState,
        memory: &mut WorkingMemory,
        input_rx: &mut mpsc::UnboundedReceiver<Log>,
        step: u32,
        run_id: &RunId,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        // Fold queued external events into this step's prompt.
        while let Ok(event) = input_rx.try_recv() {
            memory.push_input(event);
        }
        let folded = memory.drain_inputs();
        if folded > 0 {
            debug!(step, folded, "external events folded into step");
        }

        let (specs, vocabulary) = self.enabled_elements(state);
        let prompt = def.render_prompt(memory, &specs);
        memory.push(Log::step_marker(step, prompt.clone()));
        let _ = self.emitter.emit(EngineEvent::StepStart {
            base: BaseEvent::now(state.id.as_str()),
            run_id: run_id.to_string(),
            step,
        });

        let chunks = self
            .call_model(prompt, state.settings.model.clone(), cancel)
            .await?;
        let response: String = chunks.concat();

        let mut assembler = StreamAssembler::new(vocabulary);
        let mut tool_tasks: JoinSet<ToolTask> = JoinSet::new();
        let mut inflight: Vec<(String, String)> = Vec::new();
        // A step-fatal dispatch error stops further dispatching, but calls
        // already scheduled must still settle below before it propagates.
        let mut step_error: Option<EngineError> = None;
        'chunks: for chunk in &chunks {
            for element in assembler.feed(chunk) {
                if let Err(e) = self
                    .dispatch(
                        element,
                        state,
                        memory,
                        &mut tool_tasks,
                        &mut inflight,
                        step,
                        run_id,
                        cancel,
                    )
                    .await
                {
                    step_error = Some(e);
                    break 'chunks;
                }
            }
        }
        if step_error.is_none() {
            for element in assembler.finish() {
                if let Err(e) = self
                    .dispatch(
                        element,
                        state,
                        memory,
                        &mut tool_tasks,
                        &mut inflight,
                        step,
                        run_id,
                        cancel,
                    )
                    .await
                {
                    step_error = Some(e);
                    break;
                }
            }
        }
        memory.record_step_response(step, &response);

        // Settle scheduled tool calls in completion order.
        while let Some(joined) = tool_tasks.join_next().await {
            match joined {
                Ok(task) => {
                    inflight.retain(|(_, id)| id != &task.call_id);
                    self.settle_tool(task, memory, state, run_id, step);
                }
                Err(join_err) => {
                    error!(error = %join_err, "tool task aborted");
                }
            }
        }
        // Pairing invariant: a panicked handler still gets a terminal
        // result for its call.
        for (name, call_id) in inflight {
            counter!("tool_executions_total", "outcome" => "panic").increment(1);
            memory.push(Log::tool_error(
                step,
                name,
                call_id,
                "tool handler panicked",
                1,
            ));
        }
        match step_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Roster of elements offered to the model this step.
    fn enabled_elements(&self, state: &ConversationState) -> (Vec<ToolSpec>, HashSet<String>) {
        let mut specs = Vec::new();
        let mut vocabulary = HashSet::new();
        for (name, tool) in &self.registries.tools {
            if tool.enabled(state) {
                specs.push(ToolSpec {
                    name: name.clone(),
                    schema: tool.schema(),
                    role: SpecRole::Tool,
                });
                let _ = vocabulary.insert(name.clone());
            }
        }
        for (name, output) in &self.registries.outputs {
            if output.enabled(state) {
                specs.push(ToolSpec {
                    name: name.clone(),
                    schema: output.schema(),
                    role: SpecRole::Output,
                });
                let _ = vocabulary.insert(name.clone());
            }
        }
        // Registration maps are unordered; prompts must be stable.
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        (specs, vocabulary)
    }

    /// Model call through the scheduler, high priority.
    async fn call_model(
        &self,
        prompt: String,
        model: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, EngineError> {
        let provider = Arc::clone(&self.provider);
        let call_cancel = cancel.clone();
        let options = TaskOptions {
            retries: MODEL_RETRIES,
            priority: Priority::High,
            cancel: Some(cancel.clone()),
        };
        let outcome = self
            .scheduler
            .enqueue(options, move |attempt| {
                let provider = Arc::clone(&provider);
                let prompt = prompt.clone();
                let model = model.clone();
                let cancel = call_cancel.clone();
                async move {
                    if attempt > 1 {
                        debug!(attempt, "retrying model call");
                    }
                    let request = GenerateRequest {
                        prompt,
                        model,
                        cancel,
                    };
                    let mut stream = provider
                        .generate(request)
                        .await
                        .map_err(|e| e.to_string())?;
                    let mut chunks = Vec::new();
                    while let Some(event) = stream.next().await {
                        match event {
                            StreamEvent::TextDelta { delta } => chunks.push(delta),
                            StreamEvent::Done { .. } => return Ok(chunks),
                            StreamEvent::Error { error } => return Err(error),
                        }
                    }
                    Err("stream ended without a terminal event".to_string())
                }
            })
            .await;
        match outcome {
            Ok(outcome) => Ok(outcome.value),
            Err(SchedulerError::Cancelled) => Err(EngineError::Cancelled),
            Err(e) => Err(EngineError::ModelCall(e.to_string())),
        }
    }

    /// Route one completed element.
    async fn dispatch(
        &self,
        element: ElementEvent,
        state: &ConversationState,
        memory: &mut WorkingMemory,
        tool_tasks: &mut JoinSet<ToolTask>,
        inflight: &mut Vec<(String, String)>,
        step: u32,
        run_id: &RunId,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let _ = self.emitter.emit(EngineEvent::ElementParsed {
            base: BaseEvent::now(state.id.as_str()),
            run_id: run_id.to_string(),
            tag: element.tag.clone(),
            done: element.done,
        });

        if !element.done {
            if state.settings.strict_parse {
                return Err(EngineError::Parse(format!(
                    "unterminated <{}> element at end of stream",
                    element.tag
                )));
            }
            warn!(tag = %element.tag, "unterminated element kept as thought");
            memory.push(Log::thought(step, element.content));
            return Ok(());
        }

        if element.tag == THOUGHT_TAG {
            memory.push(Log::thought(step, element.content));
            return Ok(());
        }

        if let Some(tool) = self.registries.tools.get(&element.tag) {
            self.dispatch_tool(
                Arc::clone(tool),
                element,
                state,
                memory,
                tool_tasks,
                inflight,
                step,
                run_id,
                cancel,
            );
            return Ok(());
        }

        if let Some(output) = self.registries.outputs.get(&element.tag) {
            self.dispatch_output(Arc::clone(output), element, state, memory, step, run_id, cancel)
                .await;
            return Ok(());
        }

        // In the vocabulary but registered nowhere — unreachable by
        // construction of `enabled_elements`, degrade to a thought.
        warn!(tag = %element.tag, "element has no registered handler");
        memory.push(Log::thought(step, element.content));
        Ok(())
    }

    fn dispatch_tool(
        &self,
        tool: Arc<dyn crate::contracts::Tool>,
        element: ElementEvent,
        state: &ConversationState,
        memory: &mut WorkingMemory,
        tool_tasks: &mut JoinSet<ToolTask>,
        inflight: &mut Vec<(String, String)>,
        step: u32,
        run_id: &RunId,
        cancel: &CancellationToken,
    ) {
        let name = element.tag;
        let raw = element.content.trim();
        let args: Value = if raw.is_empty() {
            json!({})
        } else {
            match serde_json::from_str(raw) {
                Ok(v) => v,
                Err(e) => {
                    self.contained_failure(memory, step, &name, &format!("arguments are not valid JSON: {e}"));
                    return;
                }
            }
        };
        let resolved = match resolve_references(&args, memory) {
            Ok(v) => v,
            Err(e) => {
                self.contained_failure(memory, step, &name, &e.to_string());
                return;
            }
        };
        if let Err(reason) = tool.schema().validate(&resolved) {
            self.contained_failure(memory, step, &name, &reason);
            return;
        }

        let call_id = format!("call_{}", uuid::Uuid::now_v7());
        memory.push(Log::ToolCall {
            meta: LogMeta::new(step),
            name: name.clone(),
            call_id: call_id.clone(),
            arguments: resolved.clone(),
        });
        inflight.push((name.clone(), call_id.clone()));
        let _ = self.emitter.emit(EngineEvent::ToolStart {
            base: BaseEvent::now(state.id.as_str()),
            run_id: run_id.to_string(),
            name: name.clone(),
            call_id: call_id.clone(),
        });

        let scheduler = Arc::clone(&self.scheduler);
        let options = TaskOptions {
            retries: tool.retries(),
            priority: Priority::Normal,
            cancel: Some(cancel.clone()),
        };
        let ctx = RunContext {
            conversation_id: state.id.clone(),
            run_id: run_id.clone(),
            step,
            cancel: cancel.clone(),
        };
        let _ = tool_tasks.spawn(async move {
            let started_at = Instant::now();
            let result = scheduler
                .enqueue(options, move |_attempt| {
                    let tool = Arc::clone(&tool);
                    let args = resolved.clone();
                    let ctx = ctx.clone();
                    async move { tool.execute(args, &ctx).await.map_err(|e| e.to_string()) }
                })
                .await;
            ToolTask {
                name,
                call_id,
                elapsed_ms: u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                result,
            }
        });
    }

    async fn dispatch_output(
        &self,
        output: Arc<dyn crate::contracts::Output>,
        element: ElementEvent,
        state: &ConversationState,
        memory: &mut WorkingMemory,
        step: u32,
        run_id: &RunId,
        cancel: &CancellationToken,
    ) {
        let name = element.tag;
        let attrs_value = Value::Object(
            element
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        );
        if let Err(reason) = output.schema().validate(&attrs_value) {
            self.contained_failure(memory, step, &name, &reason);
            return;
        }
        let ctx = RunContext {
            conversation_id: state.id.clone(),
            run_id: run_id.clone(),
            step,
            cancel: cancel.clone(),
        };
        match output
            .emit(element.content.clone(), &element.attributes, &ctx)
            .await
        {
            Ok(value) => {
                memory.push(Log::OutputEvent {
                    meta: LogMeta::new(step),
                    name: name.clone(),
                    attributes: element.attributes,
                    content: element.content,
                    value,
                });
                let _ = self.emitter.emit(EngineEvent::OutputEmitted {
                    base: BaseEvent::now(state.id.as_str()),
                    run_id: run_id.to_string(),
                    name,
                });
            }
            Err(e) => {
                self.contained_failure(memory, step, &name, &e.to_string());
            }
        }
    }

    /// Record a settled tool call.
    fn settle_tool(
        &self,
        task: ToolTask,
        memory: &mut WorkingMemory,
        state: &ConversationState,
        run_id: &RunId,
        step: u32,
    ) {
        let (log, is_error, attempts) = match task.result {
            Ok(outcome) => {
                let log = Log::tool_result(
                    step,
                    &task.name,
                    &task.call_id,
                    outcome.value,
                    outcome.attempts,
                );
                (log, false, outcome.attempts)
            }
            Err(SchedulerError::Cancelled) => {
                let log = Log::tool_error(step, &task.name, &task.call_id, "cancelled", 0);
                (log, true, 0)
            }
            Err(SchedulerError::Exhausted { attempts, reason }) => {
                warn!(tool = %task.name, attempts, reason, "tool failed");
                let log = Log::tool_error(step, &task.name, &task.call_id, reason, attempts);
                (log, true, attempts)
            }
        };
        let outcome_label = if is_error { "error" } else { "ok" };
        counter!("tool_executions_total", "outcome" => outcome_label).increment(1);
        histogram!("tool_duration_ms").record(task.elapsed_ms as f64);
        let _ = self.emitter.emit(EngineEvent::ToolEnd {
            base: BaseEvent::now(state.id.as_str()),
            run_id: run_id.to_string(),
            name: task.name,
            call_id: task.call_id,
            is_error,
            attempts,
            duration_ms: task.elapsed_ms,
        });
        memory.push(log);
    }

    /// Contained element failure: an error log, never an unwound step.
    fn contained_failure(
        &self,
        memory: &mut WorkingMemory,
        step: u32,
        element: &str,
        reason: &str,
    ) {
        warn!(element, reason, "element rejected");
        counter!("element_validation_failures_total").increment(1);
        let call_id = format!("invalid_{}", uuid::Uuid::now_v7());
        memory.push(Log::tool_error(step, element, call_id, reason, 0));
    }
}
