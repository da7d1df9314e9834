use kestrel_agent::Stack;
use kestrel_target::{Location, Notification, ThreadRecord};

/// Logs a notification of the engine.
pub fn log_notification(notification: &Notification) {
    match notification {
        Notification::ProcessStarting {
            process_koid,
            name,
            filter,
        } => tracing::info!(process = process_koid, %name, %filter, "process starting"),
        Notification::ProcessExiting {
            process_koid,
            return_code,
        } => tracing::info!(process = process_koid, return_code, "process exiting"),
        Notification::ThreadStarting(record) => log_thread(record, "thread starting"),
        Notification::ThreadExiting(record) => log_thread(record, "thread exiting"),
        Notification::Modules {
            process_koid,
            modules,
            ..
        } => {
            for module in modules {
                tracing::info!(
                    process = process_koid,
                    name = %module.name,
                    base = format_args!("{:#x}", module.base),
                    end = format_args!("{:#x}", module.end),
                    "module"
                );
            }
        }
        Notification::Exception {
            thread,
            exception_type,
            hit_breakpoints,
        } => {
            let ids: Vec<_> = hit_breakpoints.iter().map(|hit| hit.id).collect();
            let ip = thread.frames.first().map(|frame| frame.address).unwrap_or_default();

            tracing::info!(
                process = thread.process_koid,
                thread = thread.thread_koid,
                %exception_type,
                ip = format_args!("{ip:#x}"),
                breakpoints = ?ids,
                "exception"
            );
        }
    }
}

fn log_thread(record: &ThreadRecord, message: &str) {
    tracing::info!(
        process = record.process_koid,
        thread = record.thread_koid,
        name = %record.name,
        state = ?record.state,
        "{message}"
    );
}

/// Logs a resolved stack, one line per frame.
pub fn log_stack(thread_koid: u64, stack: &Stack) {
    for (i, frame) in stack.frames().enumerate() {
        tracing::info!(thread = thread_koid, "#{i} {}", format_location(frame.location()));
    }
}

/// Formats a location as `address symbol (file:line)`.
pub fn format_location(location: &Location) -> String {
    let mut s = format!("{:#018x}", location.address);

    if let Some(symbol) = &location.symbol {
        s.push(' ');

        if symbol.is_inlined() {
            s.push_str("[inlined] ");
        }

        s.push_str(&symbol.name);
    }

    if let Some(file_line) = &location.file_line {
        let file = file_line.file.as_deref().unwrap_or("??");
        s.push_str(&format!(" ({file}:{})", file_line.line));
    }

    s
}
