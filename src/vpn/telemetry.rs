//! Fault telemetry for tunnel setup and teardown

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use tracing::warn;

/// Whether the failing tunnel is a system profile or app supplied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnEventType {
    Legacy,
    Extended,
}

/// Operation in progress when the fault happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnEventOperation {
    StartSa,
    ConnectSetting,
    ConnectDestroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnEventErrorType {
    Internal,
    RegNetSupplier,
    UpdateSupplierInfo,
    UpdateNetlinkInfo,
    SetAppUidRule,
    DaemonStage,
    AddressCollision,
}

impl fmt::Display for VpnEventErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VpnEventErrorType::Internal => "internal_error",
            VpnEventErrorType::RegNetSupplier => "reg_net_supplier_error",
            VpnEventErrorType::UpdateSupplierInfo => "update_supplier_info_error",
            VpnEventErrorType::UpdateNetlinkInfo => "update_netlink_info_error",
            VpnEventErrorType::SetAppUidRule => "set_app_uid_rule_error",
            VpnEventErrorType::DaemonStage => "daemon_stage_error",
            VpnEventErrorType::AddressCollision => "address_collision",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultEvent {
    pub event_type: VpnEventType,
    pub operation: VpnEventOperation,
    pub error_type: VpnEventErrorType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl FaultEvent {
    pub fn new(
        event_type: VpnEventType,
        operation: VpnEventOperation,
        error_type: VpnEventErrorType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            operation,
            error_type,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Sink for structured fault events
pub trait FaultReporter: Send + Sync {
    fn report(&self, event: FaultEvent);
}

const DEFAULT_HISTORY: usize = 64;

/// Logs faults and keeps the most recent ones
pub struct FaultLog {
    history: Mutex<VecDeque<FaultEvent>>,
    capacity: usize,
}

impl Default for FaultLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY)
    }
}

impl FaultLog {
    /// History of at most `capacity` events, never less than one
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn events(&self) -> Vec<FaultEvent> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FaultReporter for FaultLog {
    fn report(&self, event: FaultEvent) {
        warn!(
            target: "vpn_fault",
            "{:?}/{:?} {}: {}",
            event.event_type, event.operation, event.error_type, event.message
        );
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_log_bounded() {
        let log = FaultLog::with_capacity(2);
        for i in 0..3 {
            log.report(FaultEvent::new(
                VpnEventType::Legacy,
                VpnEventOperation::ConnectSetting,
                VpnEventErrorType::Internal,
                format!("fault {}", i),
            ));
        }
        let events = log.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "fault 1");
        assert_eq!(events[1].message, "fault 2");
    }

    #[test]
    fn test_zero_capacity_keeps_latest() {
        let log = FaultLog::with_capacity(0);
        for i in 0..3 {
            log.report(FaultEvent::new(
                VpnEventType::Legacy,
                VpnEventOperation::StartSa,
                VpnEventErrorType::DaemonStage,
                format!("fault {}", i),
            ));
        }
        assert_eq!(log.len(), 1);
        assert_eq!(log.events()[0].message, "fault 2");
    }
}
