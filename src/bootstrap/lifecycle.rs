//! 启动生命周期状态

use std::fmt;

use serde::Serialize;

/// 启动器生命周期状态
///
/// ```text
/// Starting → Registering → Serving → ShuttingDown → Terminated
///     └──────────┴──→ Failed
/// ```
///
/// 注册阶段收到停机信号时允许 `Registering → ShuttingDown`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BootstrapState {
    Starting,
    Registering,
    Serving,
    ShuttingDown,
    Terminated,
    Failed,
}

impl BootstrapState {
    /// 是否允许迁移到 `next`
    pub fn can_transition_to(self, next: BootstrapState) -> bool {
        use BootstrapState::*;
        matches!(
            (self, next),
            (Starting, Registering)
                | (Starting, Failed)
                | (Registering, Serving)
                | (Registering, Failed)
                | (Registering, ShuttingDown)
                | (Serving, ShuttingDown)
                | (ShuttingDown, Terminated)
        )
    }

    /// 终态
    pub fn is_terminal(self) -> bool {
        matches!(self, BootstrapState::Terminated | BootstrapState::Failed)
    }

    /// 健康检查报告的状态
    pub fn health_status(self) -> &'static str {
        match self {
            BootstrapState::Starting | BootstrapState::Registering => "STARTING",
            BootstrapState::Serving => "UP",
            _ => "DOWN",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BootstrapState::Starting => "STARTING",
            BootstrapState::Registering => "REGISTERING",
            BootstrapState::Serving => "SERVING",
            BootstrapState::ShuttingDown => "SHUTTING_DOWN",
            BootstrapState::Terminated => "TERMINATED",
            BootstrapState::Failed => "FAILED",
        }
    }

    /// `bootstrap_state` 指标的取值
    pub fn gauge_value(self) -> i64 {
        match self {
            BootstrapState::Starting => 0,
            BootstrapState::Registering => 1,
            BootstrapState::Serving => 2,
            BootstrapState::ShuttingDown => 3,
            BootstrapState::Terminated => 4,
            BootstrapState::Failed => 5,
        }
    }
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::BootstrapState::*;
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [Starting, Registering, Serving, ShuttingDown, Terminated];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_failed_only_before_serving() {
        assert!(Starting.can_transition_to(Failed));
        assert!(Registering.can_transition_to(Failed));
        assert!(!Serving.can_transition_to(Failed));
        assert!(!ShuttingDown.can_transition_to(Failed));
    }

    #[test]
    fn test_no_skipping_registration() {
        assert!(!Starting.can_transition_to(Serving));
        assert!(!Terminated.can_transition_to(Starting));
        assert!(!Failed.can_transition_to(Registering));
    }

    #[test]
    fn test_health_status() {
        assert_eq!(Starting.health_status(), "STARTING");
        assert_eq!(Registering.health_status(), "STARTING");
        assert_eq!(Serving.health_status(), "UP");
        assert_eq!(ShuttingDown.health_status(), "DOWN");
        assert!(Failed.is_terminal());
        assert_eq!(
            serde_json::to_string(&ShuttingDown).unwrap(),
            "\"SHUTTING_DOWN\""
        );
    }
}
