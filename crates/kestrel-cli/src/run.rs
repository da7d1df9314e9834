use kestrel_agent::DebugAgent;
use kestrel_ptrace::PtraceProcess;
use kestrel_symbol::{FramehopUnwinder, ModuleResolver};
use kestrel_target::{Notification, ProcessHandle, ResumeRequest, RunMode};
use miette::IntoDiagnostic;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::config::SessionConfig;
use crate::report;

type Agent = DebugAgent<PtraceProcess, UnboundedSender<Notification>>;

/// Attaches to a process and reports its stops until it terminates, or
/// until Ctrl-C.
pub async fn evaluate_attach(pid: u64, config: SessionConfig) -> miette::Result<()> {
    let process = PtraceProcess::attach(pid).await.into_diagnostic()?;
    let mut pump = process.event_pump();

    let modules = process.modules().await.into_diagnostic()?;
    let resolver = ModuleResolver::with_modules(&modules);

    let (tx, rx) = unbounded_channel();
    let mut agent = Agent::with_config(config.agent_config(), tx);
    agent.set_unwinder(Box::new(resolver.unwinder().await));

    let process_koid = agent.attach_process(process).await.into_diagnostic()?;

    for settings in config.breakpoint_settings(process_koid) {
        let id = settings.id;
        if let Err(e) = agent.add_or_change_breakpoint(settings).await {
            tracing::warn!(id, error = %e, "install breakpoint");
        }
    }

    for settings in config.watchpoint_settings(process_koid) {
        let id = settings.id;
        if let Err(e) = agent.add_or_change_watchpoint(settings).await {
            tracing::warn!(id, error = %e, "install watchpoint");
        }
    }

    agent
        .send_modules(process_koid, Vec::new())
        .await
        .into_diagnostic()?;

    let mut session = Session {
        agent,
        notifications: rx,
        unwinder: resolver.unwinder().await,
        resolver,
        process_koid,
        stack_depth: config.stack.full_frames,
    };

    session.drain_notifications().await;

    loop {
        tokio::select! {
            event = pump.next_event() => {
                let Some(event) = event else {
                    break;
                };

                session.agent.on_event(event).await;

                if session.drain_notifications().await {
                    break;
                }
            }
            res = tokio::signal::ctrl_c() => {
                res.into_diagnostic()?;
                tracing::info!(process = process_koid, "interrupted, detaching");

                session
                    .agent
                    .detach_process(process_koid)
                    .await
                    .into_diagnostic()?;

                break;
            }
        }
    }

    Ok(())
}

struct Session {
    agent: Agent,
    notifications: UnboundedReceiver<Notification>,
    resolver: ModuleResolver,
    unwinder: FramehopUnwinder,
    process_koid: u64,
    stack_depth: usize,
}

impl Session {
    /// Handles the pending notifications.
    ///
    /// Returns whether the process exited.
    async fn drain_notifications(&mut self) -> bool {
        let mut exited = false;

        while let Ok(notification) = self.notifications.try_recv() {
            report::log_notification(&notification);

            match notification {
                Notification::Modules { modules, .. } => {
                    self.resolver.set_modules(&modules);
                    self.unwinder = self.resolver.unwinder().await;
                    self.agent
                        .set_unwinder(Box::new(self.resolver.unwinder().await));
                }
                Notification::Exception { thread, .. } => {
                    self.on_exception(thread.thread_koid).await;
                }
                Notification::ProcessExiting { .. } => exited = true,
                _ => (),
            }
        }

        exited
    }

    async fn on_exception(&mut self, thread_koid: u64) {
        let stack = self
            .agent
            .stack(
                self.process_koid,
                thread_koid,
                &self.resolver,
                &mut self.unwinder,
                self.stack_depth,
            )
            .await;

        match stack {
            Ok(stack) => report::log_stack(thread_koid, &stack),
            Err(e) => tracing::warn!(thread = thread_koid, error = %e, "stack"),
        }

        let request = ResumeRequest {
            thread_koids: vec![thread_koid],
            run_mode: RunMode::Continue,
        };

        self.agent.resume(Some(self.process_koid), &request).await;
    }
}
