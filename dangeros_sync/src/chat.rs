// Chat line composition: normalization plus the two inline commands.
//
//   "2d6"      → "Dice roll (2d6): [3, 5] = total 8"
//   "15 => 5"  → "Attack: 15 ATK vs 5 DEF -> hit rate 100% / damage 10"
//
// Commands may appear anywhere in a line, any number of times. Input typed
// with a Japanese IME often arrives full-width ("２ｄ６", "１５＝＞５"), so
// full-width letters, digits and the arrow are folded to ASCII first. A line
// containing either command is flagged `is_system` so the board renders it
// as a roll result, but it keeps the sender's handle.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use dangeros_prng::BoardRng;
use dangeros_protocol::ChatMessage;
use regex::{Captures, Regex};

use crate::negotiator::Session;

/// Dice count cap per command.
pub const MAX_DICE: u64 = 100;

static DICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)[dD](\d+)").expect("dice pattern is valid"));
static ATTACK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*=>\s*(\d+)").expect("attack pattern is valid"));

/// Result of running the chat commands over one line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Composed {
    pub content: String,
    pub is_system: bool,
}

/// Fold full-width ASCII letters and digits to half-width, and `＝＞` to `=>`.
pub fn normalize(text: &str) -> String {
    text.replace("＝＞", "=>")
        .chars()
        .map(|c| match c {
            'Ａ'..='Ｚ' | 'ａ'..='ｚ' | '０'..='９' => {
                char::from_u32(c as u32 - 0xFEE0).unwrap_or(c)
            }
            _ => c,
        })
        .collect()
}

/// Hit rate in percent for an attack of `atk` against `def`.
pub fn hit_rate(atk: i64, def: i64) -> i64 {
    atk.saturating_sub(def)
        .saturating_mul(5)
        .saturating_add(50)
        .clamp(0, 100)
}

pub fn damage(atk: i64, def: i64) -> i64 {
    atk.saturating_sub(def).max(0)
}

/// Normalize `raw` and expand dice and attack commands.
pub fn process(raw: &str, rng: &mut BoardRng) -> Composed {
    let mut is_system = false;
    let text = normalize(raw.trim());

    let text = DICE.replace_all(&text, |caps: &Captures| {
        is_system = true;
        let count = caps[1].parse::<u64>().unwrap_or(u64::MAX).min(MAX_DICE);
        let sides = caps[2]
            .parse::<u64>()
            .unwrap_or(u64::MAX)
            .min(u64::from(u32::MAX)) as u32;
        if count == 0 || sides == 0 {
            return caps[0].to_owned();
        }
        let rolls: Vec<u32> = (0..count).map(|_| rng.roll(sides)).collect();
        let total: u64 = rolls.iter().map(|&r| u64::from(r)).sum();
        let listed = rolls
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        format!(" Dice roll ({count}d{sides}): [{listed}] = total {total} ")
    });

    let text = ATTACK.replace_all(&text, |caps: &Captures| {
        let (Ok(atk), Ok(def)) = (caps[1].parse::<i64>(), caps[2].parse::<i64>()) else {
            return caps[0].to_owned();
        };
        is_system = true;
        format!(
            " Attack: {atk} ATK vs {def} DEF -> hit rate {}% / damage {} ",
            hit_rate(atk, def),
            damage(atk, def)
        )
    });

    Composed {
        content: text.trim().to_owned(),
        is_system,
    }
}

/// Build the chat message the local user sends for `raw`. Blank input
/// sends nothing.
pub fn compose_message(
    session: &Session,
    raw: &str,
    rng: &mut BoardRng,
    now: DateTime<Utc>,
) -> Option<ChatMessage> {
    if raw.trim().is_empty() {
        return None;
    }
    let Composed { content, is_system } = process(raw, rng);
    Some(ChatMessage {
        id: format!("msg-{}", rng.token(12)),
        room_id: session.room_id.clone().unwrap_or_default(),
        handle_name: session.display_name.clone(),
        content,
        is_system,
        created_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rng() -> BoardRng {
        BoardRng::new(42)
    }

    #[test]
    fn full_width_input_is_folded() {
        assert_eq!(normalize("２ｄ６"), "2d6");
        assert_eq!(normalize("１５＝＞５"), "15=>5");
        assert_eq!(normalize("ＡＴＫ　ok"), "ATK　ok");
    }

    #[test]
    fn dice_results_add_up() {
        let out = process("2d6", &mut rng());
        assert!(out.is_system);

        let re = Regex::new(r"^Dice roll \(2d6\): \[(\d+), (\d+)\] = total (\d+)$").unwrap();
        let caps = re.captures(&out.content).unwrap();
        let a: u32 = caps[1].parse().unwrap();
        let b: u32 = caps[2].parse().unwrap();
        let total: u32 = caps[3].parse().unwrap();
        assert!((1..=6).contains(&a));
        assert!((1..=6).contains(&b));
        assert_eq!(a + b, total);
    }

    #[test]
    fn dice_count_is_capped() {
        let out = process("500d2", &mut rng());
        assert!(out.content.starts_with("Dice roll (100d2): ["));
        let listed = out.content.split('[').nth(1).unwrap();
        assert_eq!(listed.split(", ").count(), 100);
    }

    #[test]
    fn zero_dice_are_left_alone_but_still_flagged() {
        let out = process("0d6", &mut rng());
        assert_eq!(out.content, "0d6");
        assert!(out.is_system);
    }

    #[test]
    fn attack_formula() {
        let out = process("15 => 5", &mut rng());
        assert_eq!(
            out.content,
            "Attack: 15 ATK vs 5 DEF -> hit rate 100% / damage 10"
        );
        assert!(out.is_system);

        let out = process("３＝＞９", &mut rng());
        assert_eq!(out.content, "Attack: 3 ATK vs 9 DEF -> hit rate 20% / damage 0");
    }

    #[test]
    fn hit_rate_is_clamped() {
        assert_eq!(hit_rate(10, 10), 50);
        assert_eq!(hit_rate(0, 50), 0);
        assert_eq!(hit_rate(50, 0), 100);
        assert_eq!(damage(2, 7), 0);
    }

    #[test]
    fn commands_inside_a_sentence() {
        let out = process("  I swing 12=>10 at it ", &mut rng());
        assert_eq!(
            out.content,
            "I swing  Attack: 12 ATK vs 10 DEF -> hit rate 60% / damage 2  at it"
        );
    }

    #[test]
    fn plain_text_is_not_system() {
        let out = process("hello there", &mut rng());
        assert_eq!(
            out,
            Composed {
                content: "hello there".into(),
                is_system: false
            }
        );
    }

    #[test]
    fn blank_input_composes_nothing() {
        let session = Session::default();
        assert!(compose_message(&session, "   ", &mut rng(), Utc::now()).is_none());
    }

    #[test]
    fn composed_message_carries_the_session() {
        let session = Session {
            display_name: "Alice".into(),
            room_id: Some("room-den".into()),
            ..Session::default()
        };
        let now = Utc::now();
        let message = compose_message(&session, "1d1", &mut rng(), now).unwrap();
        assert_eq!(message.handle_name, "Alice");
        assert_eq!(message.room_id, "room-den");
        assert_eq!(message.content, "Dice roll (1d1): [1] = total 1");
        assert!(message.is_system);
        assert_eq!(message.created_at, now);
        assert!(message.id.starts_with("msg-"));
    }
}
