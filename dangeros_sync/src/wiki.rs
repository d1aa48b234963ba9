// Board ⇄ PukiWiki text.
//
// Battle reports are kept on a PukiWiki, so the board can print itself in
// that markup and read character tables back from it. The export has two
// parts:
//
//   |BGCOLOR(silver):|BGCOLOR(silver):&color(silver){＿}''１''&color(silver){＿}|…|
//   |BGCOLOR(silver):''Ａ''|[[Kiri]]||BGCOLOR(black):…壁…|…|        ← 7×5 grid
//
//   *生徒会　DP：3                                                   ← per team
//   |BGCOLOR(silver):名前|…|BGCOLOR(silver):備考|
//   |[[Kiri]]|女|12|8|10|5|1|Thunder|80|70|leader（死亡）|
//
// Teams print in fixed order and are skipped when they have no characters
// and zero DP. The dead / ability-rest flags are appended to the remarks as
// `（死亡・能力休み）`.
//
// Import reads only the team headings and the character tables (grid rows
// are recognizable by their `BGCOLOR(` first cell and skipped). Imported
// characters get fresh ids, full HP/MP, and no position; the caller applies
// the result as ordinary local mutations, so they sync like any other edit.

use std::fmt::Write as _;
use std::sync::LazyLock;

use dangeros_prng::BoardRng;
use dangeros_protocol::{
    BoardState, EntityId, GRID_COLUMNS, GRID_ROWS, Gender, GridPos, Team, Unit, UnitKind,
};
use regex::Regex;

use crate::store::Mutation;

const ROW_LABELS: [&str; 5] = ["Ａ", "Ｂ", "Ｃ", "Ｄ", "Ｅ"];
const COLUMN_LABELS: [&str; 7] = ["１", "２", "３", "４", "５", "６", "７"];

const WALL_CELL: &str = "BGCOLOR(black):&color(white){&color(black){__}壁&color(black){__}}";
const STATUS_HEADER: &str = "|BGCOLOR(silver):名前|BGCOLOR(silver):性別|BGCOLOR(silver):攻撃\
|BGCOLOR(silver):防御|BGCOLOR(silver):体力|BGCOLOR(silver):精神|BGCOLOR(silver):FS\
|BGCOLOR(silver):能力名|BGCOLOR(silver):発動|BGCOLOR(silver):成功|BGCOLOR(silver):備考|";

const DEAD_TAG: &str = "死亡";
const REST_TAG: &str = "能力休み";

/// Rates assumed when a table leaves them blank.
const DEFAULT_RATE: i32 = 100;

static DP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)DP[：:]\s*(\d+)").expect("dp pattern is valid"));

/// One change read from wiki text.
#[derive(Clone, Debug, PartialEq)]
pub enum WikiImport {
    Unit(Unit),
    Counter { team: Team, value: i64 },
}

impl WikiImport {
    pub fn into_mutation(self) -> Mutation {
        match self {
            WikiImport::Unit(unit) => Mutation::AddUnit(unit),
            WikiImport::Counter { team, value } => Mutation::SetCounter { team, value },
        }
    }
}

/// Render the board and the team tables.
pub fn export(state: &BoardState) -> String {
    let mut out = String::from("|BGCOLOR(silver):");
    for column in COLUMN_LABELS {
        let _ = write!(
            out,
            "|BGCOLOR(silver):&color(silver){{＿}}''{column}''&color(silver){{＿}}"
        );
    }
    out.push_str("|\n");

    for y in 0..GRID_ROWS {
        let _ = write!(out, "|BGCOLOR(silver):''{}''", ROW_LABELS[usize::from(y)]);
        for x in 0..GRID_COLUMNS {
            out.push('|');
            let here = GridPos { x, y };
            for unit in state.units.iter().filter(|u| u.position == Some(here)) {
                match unit.kind {
                    UnitKind::Wall => out.push_str(WALL_CELL),
                    UnitKind::Character => {
                        let _ = write!(out, "[[{}]]", unit.name);
                    }
                }
            }
        }
        out.push_str("|\n");
    }

    for team in Team::ALL {
        let members: Vec<&Unit> = state
            .units
            .iter()
            .filter(|u| u.kind == UnitKind::Character && u.team == Some(team))
            .collect();
        let dp = state.counter(team);
        if members.is_empty() && dp == 0 {
            continue;
        }
        let _ = write!(out, "\n*{}　DP：{dp}\n", team.label());
        out.push_str(STATUS_HEADER);
        out.push('\n');
        for unit in members {
            status_row(&mut out, unit);
        }
    }
    out
}

fn status_row(out: &mut String, unit: &Unit) {
    let mut tags = Vec::new();
    if unit.is_down() {
        tags.push(DEAD_TAG);
    }
    if unit.is_ability_rest {
        tags.push(REST_TAG);
    }
    let base = unit.remarks.as_deref().unwrap_or("");
    let remarks = match (base.is_empty(), tags.is_empty()) {
        (_, true) => base.to_owned(),
        (true, false) => tags.join("・"),
        (false, false) => format!("{base}（{}）", tags.join("・")),
    };
    let optional = |v: Option<i32>| v.map(|v| v.to_string()).unwrap_or_default();

    let _ = writeln!(
        out,
        "|[[{}]]|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|",
        unit.name,
        unit.gender.map(Gender::label).unwrap_or(""),
        unit.atk,
        unit.def,
        unit.hp,
        unit.mp,
        unit.fs_value,
        unit.ability_name.as_deref().unwrap_or(""),
        optional(unit.activation_rate),
        optional(unit.success_rate),
        remarks,
    );
}

/// Read team DP headings and character rows. Characters belong to the most
/// recent heading's team (その他 before any heading).
pub fn import(text: &str, room_id: &str, rng: &mut BoardRng) -> Vec<WikiImport> {
    let mut team = Team::Other;
    let mut out = Vec::new();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(heading) = line.strip_prefix('*') {
            let label: String = heading.chars().take_while(|c| !c.is_whitespace()).collect();
            if let Some(named) = Team::from_label(&label) {
                team = named;
            }
            if let Some(value) = DP.captures(line).and_then(|c| c[1].parse().ok()) {
                out.push(WikiImport::Counter { team, value });
            }
            continue;
        }
        if line.len() > 1 && line.starts_with('|') && line.ends_with('|') {
            if let Some(unit) = parse_row(line, team, room_id, rng) {
                out.push(WikiImport::Unit(unit));
            }
        }
    }
    out
}

fn parse_row(line: &str, team: Team, room_id: &str, rng: &mut BoardRng) -> Option<Unit> {
    let inner = &line[1..line.len() - 1];
    let cells: Vec<&str> = inner.split('|').map(str::trim).collect();
    let cell = |i: usize| cells.get(i).copied().unwrap_or("");

    if cells.len() < 5
        || cell(0).contains("名前")
        || cell(1).contains("性別")
        || cell(0).starts_with("BGCOLOR(")
    {
        return None;
    }

    let name = match cell(0).strip_prefix("[[").and_then(|s| s.split_once("]]")) {
        Some((name, _)) => name,
        None => cell(0),
    };
    if name.is_empty() {
        return None;
    }

    let stat = |i: usize| leading_int(cell(i)).unwrap_or(0);
    let rate = |i: usize| leading_int(cell(i)).unwrap_or(DEFAULT_RATE);
    let hp = stat(4);
    let mp = stat(5);
    let (remarks, dead, rest) = split_state_tags(cell(10));

    let mut unit = Unit::character(EntityId::new(rng.unit_id()), room_id, name);
    unit.gender = Some(Gender::from_label(cell(1)).unwrap_or(Gender::Neither));
    unit.team = Some(team);
    unit.atk = stat(2);
    unit.def = stat(3);
    unit.hp = hp;
    unit.max_hp = hp;
    unit.mp = mp;
    unit.max_mp = mp;
    unit.fs_value = stat(6);
    unit.ability_name = Some(cell(7)).filter(|s| !s.is_empty()).map(str::to_owned);
    unit.activation_rate = Some(rate(8));
    unit.success_rate = Some(rate(9));
    unit.remarks = remarks;
    unit.is_dead = dead || hp <= 0;
    unit.is_ability_rest = rest;
    Some(unit)
}

/// `"-12abc"` → `Some(-12)`; no leading digits → `None`.
fn leading_int(s: &str) -> Option<i32> {
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse::<i32>().ok().map(|n| sign * n)
}

/// Undo what `status_row` appended: returns the plain remarks and the
/// dead / ability-rest flags.
fn split_state_tags(remarks: &str) -> (Option<String>, bool, bool) {
    let dead = remarks.contains(DEAD_TAG);
    let rest = remarks.contains(REST_TAG);
    let only_tags = |s: &str| s.split('・').all(|t| t == DEAD_TAG || t == REST_TAG);

    let base = match remarks.strip_suffix('）').and_then(|s| s.rsplit_once('（')) {
        Some((base, tags)) if only_tags(tags) => base,
        _ if only_tags(remarks) => "",
        _ => remarks,
    };
    let base = Some(base.trim()).filter(|s| !s.is_empty()).map(str::to_owned);
    (base, dead, rest)
}
