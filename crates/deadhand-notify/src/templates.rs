//! Notification message templates

use serde::{Deserialize, Serialize};

/// Notification urgency level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NotificationLevel {
    /// Check-in overdue
    Reminder = 1,
    /// Identity confirmation requested
    Warning = 2,
    /// Succession threshold approaching
    Urgent = 3,
    /// Succession case opened or settled
    Critical = 4,
}

/// A notification message ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    /// Message subject
    pub subject: String,
    /// Message body (plain text)
    pub body: String,
    /// Urgency level
    pub level: NotificationLevel,
}

fn days_str(days: i64) -> String {
    if days == 1 {
        "1 day".to_string()
    } else {
        format!("{} days", days)
    }
}

/// Check-in reminder sent to the principal as liveness escalates.
pub fn liveness_reminder(
    level: NotificationLevel,
    principal: &str,
    days_silent: i64,
    days_until_succession: i64,
) -> NotificationMessage {
    let (subject, body) = match level {
        NotificationLevel::Reminder => (
            format!("Deadhand: check-in overdue ({} since last)", days_str(days_silent)),
            format!(
                r#"Hello {},

Your last Deadhand check-in was {} ago, which is past your configured
check-in interval.

Succession can begin in approximately {} if no check-in arrives.

Please check in at your earliest convenience.

Deadhand"#,
                principal,
                days_str(days_silent),
                days_str(days_until_succession)
            ),
        ),
        _ => (
            format!(
                "URGENT Deadhand: {} until succession begins",
                days_str(days_until_succession)
            ),
            format!(
                r#"URGENT: Check-in Required

Hello {},

Deadhand has not heard from you in {}. Your succession plan will start
in approximately {}.

Once succession starts, your verification contacts will be asked to confirm
and your shard custodians to submit their shards.

Check in now to stop this.

Deadhand"#,
                principal,
                days_str(days_silent),
                days_str(days_until_succession)
            ),
        ),
    };

    NotificationMessage {
        subject,
        body,
        level,
    }
}

/// Request sent to a verification channel when a case needs confirmation.
pub fn confirmation_request(
    principal: &str,
    case_id: &str,
    channel: &str,
    window_hours: i64,
) -> NotificationMessage {
    NotificationMessage {
        subject: format!("Deadhand: confirmation requested for {}", principal),
        body: format!(
            r#"A succession case ({}) has been opened for {}.

You are registered as the {} verification contact. Please confirm the
situation through this channel. Your confirmation stays valid for {} hours;
after that you will be asked again.

If you believe this is a mistake, do not confirm.

Deadhand"#,
            case_id, principal, channel, window_hours
        ),
        level: NotificationLevel::Warning,
    }
}

/// Notice of a case outcome (opened, aborted, completed).
pub fn case_notice(principal: &str, case_id: &str, outcome: &str) -> NotificationMessage {
    NotificationMessage {
        subject: format!("Deadhand: succession case {} {}", case_id, outcome),
        body: format!(
            r#"Succession case {} for {} is now {}.

The full history of this case is recorded in the audit log.

Deadhand"#,
            case_id, principal, outcome
        ),
        level: NotificationLevel::Critical,
    }
}
