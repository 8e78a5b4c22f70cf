//! Notification message templates.

use super::Cell;
use crate::analysis::Precision;
use crate::models::{ChamberForecast, MovementDigest, PollHistory, PollLine, SeatForecast};
use crate::sources::Chamber;
use chrono::Datelike;

/// `D` for a positive Democratic-minus-Republican value, otherwise `R`.
pub fn leader(value: f64) -> char {
    if value > 0.0 {
        'D'
    } else {
        'R'
    }
}

/// Display a value rounded to two decimals.
fn two_decimals(value: f64) -> String {
    Cell::Number(Precision::TWO.round(value)).to_string()
}

/// Generic-ballot average message.
///
/// `lead` and `change` arrive unrounded; rounding happens here only.
pub fn gcb_message(dem: f64, rep: f64, lead: f64, change: f64) -> String {
    format!(
        "GCB\nD:{} R:{}\n{}+{} (chg: {}+{})",
        two_decimals(dem),
        two_decimals(rep),
        leader(lead),
        two_decimals(lead.abs()),
        leader(change),
        two_decimals(change.abs()),
    )
}

pub fn chamber_message(chamber: Chamber, forecast: &ChamberForecast) -> String {
    format!(
        "{} ({})\nControl: D:{}% R:{}%\nSeats: D:{} R:{}",
        chamber.name().to_uppercase(),
        forecast.expression,
        forecast.prob_d,
        forecast.prob_r,
        forecast.seats_d,
        forecast.seats_r,
    )
}

pub fn seat_line(seat: &str, forecast: &SeatForecast) -> String {
    format!(
        "{}: {}(D):{}% {}(R):{}% ({}+{})",
        seat.to_uppercase(),
        forecast.name_d,
        forecast.prob_d,
        forecast.name_r,
        forecast.prob_r,
        forecast.margin_leader,
        Cell::Number(forecast.margin),
    )
}

/// Seat lines under a `{CHAMBER} DETAILS ({expression})` header.
///
/// Returns `None` when no seat changed.
pub fn seats_message(chamber: Chamber, expression: &str, lines: &[String]) -> Option<String> {
    if lines.is_empty() {
        return None;
    }
    let mut message = format!(
        "{} DETAILS ({})",
        chamber.name().to_uppercase(),
        expression.trim_start_matches('_')
    );
    for line in lines {
        message.push('\n');
        message.push_str(line);
    }
    Some(message)
}

pub fn movement_message(label: &str, digest: &MovementDigest) -> String {
    let mut message = format!("MOVEMENT: {}\nGroups: {}", label, digest.rows);
    if let (Some(top), Some(change)) = (&digest.top, digest.change) {
        message.push_str(&format!(
            "\nTop mover: {} ({}+{})",
            top,
            leader(change),
            Cell::Number(change.abs())
        ));
    }
    message
}

/// `D+x`, `R+x`, or `+0.0` when level.
fn lean(value: f64) -> String {
    let side = if value == 0.0 {
        ""
    } else if value > 0.0 {
        "D"
    } else {
        "R"
    };
    format!("{}+{}", side, Cell::Number(value.abs()))
}

fn poll_line(poll: &PollLine) -> String {
    let mut line = format!(
        "{}/{}-{}/{} ({} {}): D:{} R:{} => {}",
        poll.span.start.month(),
        poll.span.start.day(),
        poll.span.end.month(),
        poll.span.end.day(),
        poll.sample_size,
        poll.population,
        Cell::Number(poll.dem),
        Cell::Number(poll.rep),
        lean(poll.margin),
    );
    if let Some(change) = poll.change {
        line.push_str(&format!(" (Change: {})", lean(change)));
    }
    line
}

/// Blank and `false` flags are not shown.
fn flag_set(value: &str) -> bool {
    !value.is_empty() && !value.eq_ignore_ascii_case("false")
}

/// Pollster header, sponsor line, then one line per poll.
pub fn new_poll_message(history: &PollHistory) -> String {
    let mut sponsor_line = vec![format!("Sponsor(s): {}", history.sponsors)];
    if flag_set(&history.partisan) {
        sponsor_line.push(format!("Partisan: {}", history.partisan));
    }
    if flag_set(&history.internal) {
        sponsor_line.push(format!("Internal: {}", history.internal));
    }

    let mut lines = vec![
        format!(
            "Pollster: {} | Grade: {} | Method: {}",
            history.pollster, history.grade, history.methodology
        ),
        sponsor_line.join(" | "),
    ];
    lines.extend(history.polls.iter().map(poll_line));
    lines.join("\n")
}

/// Messages are delivered as one body separated by blank lines.
pub fn join_messages(messages: &[String]) -> String {
    messages.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DateSpan;

    #[test]
    fn test_gcb_message() {
        let message = gcb_message(45.123, 44.0, 1.123, -0.456);
        assert_eq!(message, "GCB\nD:45.12 R:44.0\nD+1.12 (chg: R+0.46)");
    }

    #[test]
    fn test_zero_lead_goes_to_r() {
        assert_eq!(leader(0.0), 'R');
        assert_eq!(leader(0.01), 'D');
    }

    #[test]
    fn test_chamber_message() {
        let forecast = ChamberForecast {
            prob_d: 55,
            prob_r: 45,
            seats_d: 50,
            seats_r: 50,
            expression: "deluxe".into(),
        };
        assert_eq!(
            chamber_message(Chamber::Senate, &forecast),
            "SENATE (deluxe)\nControl: D:55% R:45%\nSeats: D:50 R:50"
        );
    }

    #[test]
    fn test_seats_message() {
        let forecast = SeatForecast {
            name_d: "Kelly".into(),
            name_r: "Masters".into(),
            prob_d: 78,
            prob_r: 22,
            margin: 4.3,
            margin_leader: "D".into(),
        };
        let line = seat_line("az", &forecast);
        assert_eq!(line, "AZ: Kelly(D):78% Masters(R):22% (D+4.3)");

        let message = seats_message(Chamber::Senate, "_deluxe", &[line]).unwrap();
        assert_eq!(message, "SENATE DETAILS (deluxe)\nAZ: Kelly(D):78% Masters(R):22% (D+4.3)");
        assert!(seats_message(Chamber::House, "_deluxe", &[]).is_none());
    }

    #[test]
    fn test_movement_message() {
        let digest = MovementDigest {
            rows: 12,
            top: Some("Acme / LV".into()),
            change: Some(-3.5),
        };
        assert_eq!(
            movement_message("1-Dobbs", &digest),
            "MOVEMENT: 1-Dobbs\nGroups: 12\nTop mover: Acme / LV (R+3.5)"
        );
    }

    #[test]
    fn test_new_poll_message() {
        let day = |m, d| chrono::NaiveDate::from_ymd_opt(2022, m, d).unwrap();
        let line = |start, end, dem, rep, change| PollLine {
            span: DateSpan::new(start, end),
            sample_size: "800".into(),
            population: "RV".into(),
            dem,
            rep,
            margin: dem - rep,
            change,
        };
        let history = PollHistory {
            pollster: "Beta Polling".into(),
            grade: "Unrated".into(),
            methodology: "Live Phone".into(),
            sponsors: "Daily News".into(),
            partisan: "DEM".into(),
            internal: "false".into(),
            polls: vec![
                line(day(7, 5), day(7, 8), 44.0, 44.0, Some(-2.0)),
                line(day(6, 20), day(6, 26), 43.0, 41.0, Some(0.0)),
                line(day(6, 1), day(6, 3), 43.0, 41.0, None),
            ],
        };
        assert_eq!(
            new_poll_message(&history),
            "Pollster: Beta Polling | Grade: Unrated | Method: Live Phone\n\
             Sponsor(s): Daily News | Partisan: DEM\n\
             7/5-7/8 (800 RV): D:44.0 R:44.0 => +0.0 (Change: R+2.0)\n\
             6/20-6/26 (800 RV): D:43.0 R:41.0 => D+2.0 (Change: +0.0)\n\
             6/1-6/3 (800 RV): D:43.0 R:41.0 => D+2.0"
        );
    }

    #[test]
    fn test_join_messages() {
        assert_eq!(join_messages(&["a".into(), "b".into()]), "a\n\nb");
    }
}
