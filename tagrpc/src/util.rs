// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::time::{Duration, SystemTime};

/// Extension trait for [SystemTimes](SystemTime) in the future, i.e. deadlines.
pub trait TimeUntil {
    /// How much time from now until this time is reached.
    fn time_until(&self) -> Duration;
}

impl TimeUntil for SystemTime {
    fn time_until(&self) -> Duration {
        self.duration_since(SystemTime::now()).unwrap_or_default()
    }
}

/// Formats an optional deadline for span fields.
pub(crate) fn display_deadline(deadline: Option<SystemTime>) -> String {
    match deadline {
        Some(deadline) => humantime::format_rfc3339(deadline).to_string(),
        None => "none".to_string(),
    }
}

#[test]
fn past_deadlines_are_due_now() {
    let past = SystemTime::now() - Duration::from_secs(1);
    assert_eq!(past.time_until(), Duration::ZERO);
    let future = SystemTime::now() + Duration::from_secs(60);
    assert!(future.time_until() > Duration::from_secs(50));
}
