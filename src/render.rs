//! Poll tally rendering.
//!
//! Output is markdown and must stay byte-for-byte stable: existing polls are
//! edited in place, and readers compare old and new renders.

use crate::consts::{BAR_EMPTY, BAR_FILLED, BAR_UNITS, option_label, vote_letter};
use crate::store::{PollId, Tally};

/// Where vote links point; voters send a private message from there.
pub const VOTE_LINK_BASE: &str = "http://www.reddit.com/message/compose/";

#[derive(Debug, Clone)]
pub struct PollRenderer {
    /// Recipient of vote messages.
    bot_name: String,
}

impl PollRenderer {
    pub fn new(bot_name: impl Into<String>) -> Self {
        Self {
            bot_name: bot_name.into(),
        }
    }

    /// Render a poll. Option `i` is labelled with the `i`-th letter; tally
    /// entries for indices past the last option are ignored.
    pub fn render<S: AsRef<str>>(
        &self,
        poll_id: PollId,
        title: &str,
        options: &[S],
        tally: &Tally,
    ) -> String {
        let mut out = String::new();
        out.push_str(&format!("Poll question: **{title}**  \n\n"));

        let votes_for = |i: usize| tally.get(&i).copied().unwrap_or(0);
        let total: u32 = (0..options.len()).map(votes_for).sum();
        out.push_str(&format!("Total votes: {total}  \n\n"));

        for i in 0..options.len() {
            let votes = votes_for(i);
            let percent = rounded_percent(votes, total);
            let filled = bar_units(percent);

            out.push_str(&format!("    {}. ", option_label(i)));
            for unit in 0..BAR_UNITS {
                out.push_str(if unit < filled { BAR_FILLED } else { BAR_EMPTY });
            }
            out.push_str(&format!("  {percent:6.2}%  {votes:4} votes  \n"));
        }

        out.push_str("\n\n");
        for (i, option) in options.iter().enumerate() {
            out.push_str(&format!(
                "- {}. {} \\([vote]({VOTE_LINK_BASE}?to={}&message=vote+{}&subject=Poll+{})\\)  \n",
                option_label(i),
                option.as_ref(),
                self.bot_name,
                vote_letter(i),
                poll_id,
            ));
        }

        out
    }
}

/// `votes / total` as a percentage rounded to two decimals, `0.0` when
/// there are no votes.
///
/// Rounding is half-to-even on the exact binary value of the percentage,
/// so `3.125` (one vote in 32) becomes `3.12`.
pub fn rounded_percent(votes: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let raw = votes as f64 / total as f64 * 100.0;
    hundredths_half_even(raw) as f64 / 100.0
}

/// `value * 100` rounded half-to-even, computed on the exact binary value.
fn hundredths_half_even(value: f64) -> u64 {
    let bits = value.to_bits();
    let biased_exp = ((bits >> 52) & 0x7ff) as i32;
    let fraction = bits & ((1u64 << 52) - 1);
    let (mantissa, exp) = if biased_exp == 0 {
        (fraction, -1074)
    } else {
        (fraction | (1u64 << 52), biased_exp - 1075)
    };

    // value * 100 == scaled * 2^exp
    let scaled = mantissa as u128 * 100;
    if exp >= 0 {
        return (scaled << exp.min(64)) as u64;
    }
    let shift = exp.unsigned_abs();
    if shift >= 127 {
        return 0;
    }
    let whole = scaled >> shift;
    let rem = scaled & ((1u128 << shift) - 1);
    let half = 1u128 << (shift - 1);
    let round_up = rem > half || (rem == half && whole & 1 == 1);
    (whole + u128::from(round_up)) as u64
}

/// Number of filled bar units (each 5%) for a rounded percentage.
///
/// The integer part is snapped to a multiple of 5: remainders 0-2 round
/// down, 3-4 round up (62 -> 60, 63 -> 65, 68 -> 70).
pub fn bar_units(percent: f64) -> usize {
    let mut whole = percent as u32;
    let rem = whole % 5;
    if rem < 3 {
        whole -= rem;
    } else {
        whole += 5 - rem;
    }
    ((whole / 5) as usize).min(BAR_UNITS)
}
