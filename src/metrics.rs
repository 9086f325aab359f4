// 进程内指标计数器
// 文本格式由 /metrics 端点输出

use std::sync::{Mutex, OnceLock};

static METRICS: OnceLock<Mutex<MetricsState>> = OnceLock::new();

#[derive(Default)]
struct MetricsState {
    intents_created: u64,
    intent_transitions: u64,
    chain_events_applied: u64,
    chain_events_duplicate: u64,
    chain_events_deferred: u64,
    chain_rpc_ok: u64,
    chain_rpc_err: u64,
    webhook_delivered: u64,
    webhook_failed_attempts: u64,
    webhook_exhausted: u64,
    payouts_sent: u64,
}

fn state() -> &'static Mutex<MetricsState> {
    METRICS.get_or_init(|| Mutex::new(MetricsState::default()))
}

pub fn inc_intents_created() {
    if let Ok(mut s) = state().lock() {
        s.intents_created += 1;
    }
}

pub fn inc_intent_transitions() {
    if let Ok(mut s) = state().lock() {
        s.intent_transitions += 1;
    }
}

pub fn inc_chain_events_applied() {
    if let Ok(mut s) = state().lock() {
        s.chain_events_applied += 1;
    }
}

pub fn inc_chain_events_duplicate() {
    if let Ok(mut s) = state().lock() {
        s.chain_events_duplicate += 1;
    }
}

pub fn inc_chain_events_deferred() {
    if let Ok(mut s) = state().lock() {
        s.chain_events_deferred += 1;
    }
}

pub fn inc_chain_rpc_ok() {
    if let Ok(mut s) = state().lock() {
        s.chain_rpc_ok += 1;
    }
}

pub fn inc_chain_rpc_err() {
    if let Ok(mut s) = state().lock() {
        s.chain_rpc_err += 1;
    }
}

pub fn inc_webhook_delivered() {
    if let Ok(mut s) = state().lock() {
        s.webhook_delivered += 1;
    }
}

pub fn inc_webhook_failed_attempts() {
    if let Ok(mut s) = state().lock() {
        s.webhook_failed_attempts += 1;
    }
}

pub fn inc_webhook_exhausted() {
    if let Ok(mut s) = state().lock() {
        s.webhook_exhausted += 1;
    }
}

pub fn inc_payouts_sent() {
    if let Ok(mut s) = state().lock() {
        s.payouts_sent += 1;
    }
}

/// 文本格式输出（Prometheus 风格的 name value 行）
pub fn render() -> String {
    let s = match state().lock() {
        Ok(s) => s,
        Err(_) => return String::new(),
    };
    let mut out = String::new();
    let pairs = [
        ("dotgate_intents_created_total", s.intents_created),
        ("dotgate_intent_transitions_total", s.intent_transitions),
        ("dotgate_chain_events_applied_total", s.chain_events_applied),
        (
            "dotgate_chain_events_duplicate_total",
            s.chain_events_duplicate,
        ),
        (
            "dotgate_chain_events_deferred_total",
            s.chain_events_deferred,
        ),
        ("dotgate_chain_rpc_ok_total", s.chain_rpc_ok),
        ("dotgate_chain_rpc_err_total", s.chain_rpc_err),
        ("dotgate_webhook_delivered_total", s.webhook_delivered),
        (
            "dotgate_webhook_failed_attempts_total",
            s.webhook_failed_attempts,
        ),
        ("dotgate_webhook_exhausted_total", s.webhook_exhausted),
        ("dotgate_payouts_sent_total", s.payouts_sent),
    ];
    for (name, value) in pairs {
        out.push_str(name);
        out.push(' ');
        out.push_str(&value.to_string());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_counters() {
        inc_intents_created();
        let text = render();
        assert!(text.contains("dotgate_intents_created_total"));
        assert!(text.contains("dotgate_webhook_delivered_total 0")
            || text.contains("dotgate_webhook_delivered_total"));
    }
}
