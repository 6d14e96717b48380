use std::collections::VecDeque;

use rand::Rng;

use crate::models::{Command, DiceRoll, Link, PostId, Segment};
use crate::parent_cache::ParentCache;

pub const MAX_DICE: u8 = 10;
pub const MAX_FACES: u16 = 100;

const EIGHT_BALL: &[&str] = &[
    "Yes",
    "No",
    "Maybe",
    "It can't be helped",
    "Hell yeah, motherfucker!",
    "Ara ara",
    "Concentrate and ask again",
    "Outlook not so good",
];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedBody {
    pub segments: Vec<Segment>,
    /// Confirmed link targets in order of appearance, without duplicates
    pub links: Vec<Link>,
}

/// Splits a raw body into text runs, confirmed links and hash commands.
///
/// Whitespace is preserved exactly; a `>>N` token only becomes a link when the
/// cache knows post `N`. Command results listed in `prior` are reused in order
/// so re-parsing an edited body does not re-roll earlier commands.
pub fn parse_body<R: Rng + ?Sized>(
    text: &str,
    cache: &ParentCache,
    rng: &mut R,
    prior: &[Command],
) -> ParsedBody {
    let mut prior: VecDeque<Command> = prior.iter().cloned().collect();
    let mut out = ParsedBody::default();
    let mut run = String::new();

    for (is_space, token) in tokens(text) {
        if is_space {
            run.push_str(token);
            continue;
        }
        if let Some(id) = parse_link(token) {
            if let Some(parent) = cache.get(id) {
                let link = Link { id, thread: parent.thread, board: parent.board };
                flush(&mut run, &mut out.segments);
                if !out.links.iter().any(|l| l.id == id) {
                    out.links.push(link.clone());
                }
                out.segments.push(Segment::Link { link });
                continue;
            }
        }
        if let Some(kind) = parse_command(token) {
            let command = match prior.front() {
                Some(p) if kind.matches(p) => prior.pop_front().unwrap_or_else(|| kind.roll(rng)),
                _ => kind.roll(rng),
            };
            flush(&mut run, &mut out.segments);
            out.segments.push(Segment::Command { command });
            continue;
        }
        run.push_str(token);
    }
    flush(&mut run, &mut out.segments);
    out
}

/// Commands of a parsed body, in order.
pub fn commands(body: &[Segment]) -> Vec<Command> {
    body.iter()
        .filter_map(|s| match s {
            Segment::Command { command } => Some(command.clone()),
            _ => None,
        })
        .collect()
}

fn flush(run: &mut String, segments: &mut Vec<Segment>) {
    if !run.is_empty() {
        segments.push(Segment::Text(std::mem::take(run)));
    }
}

/// Alternating whitespace / non-whitespace runs.
fn tokens(text: &str) -> impl Iterator<Item = (bool, &str)> {
    let mut rest = text;
    std::iter::from_fn(move || {
        let first = rest.chars().next()?;
        let space = first.is_whitespace();
        let end = rest
            .char_indices()
            .find(|(_, c)| c.is_whitespace() != space)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let (tok, tail) = rest.split_at(end);
        rest = tail;
        Some((space, tok))
    })
}

fn parse_link(token: &str) -> Option<PostId> {
    let digits = token.strip_prefix(">>")?;
    if digits.is_empty() || digits.len() > 19 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    Flip,
    EightBall,
    Dice { count: u8, faces: u16, bias: i16 },
}

impl CommandKind {
    fn matches(&self, prior: &Command) -> bool {
        match (self, prior) {
            (CommandKind::Flip, Command::Flip(_)) => true,
            (CommandKind::EightBall, Command::EightBall(_)) => true,
            (CommandKind::Dice { count, faces, bias }, Command::Dice(d)) => {
                d.count == *count && d.faces == *faces && d.bias == *bias
            }
            _ => false,
        }
    }

    fn roll<R: Rng + ?Sized>(&self, rng: &mut R) -> Command {
        match *self {
            CommandKind::Flip => Command::Flip(rng.gen_bool(0.5)),
            CommandKind::EightBall => {
                Command::EightBall(EIGHT_BALL[rng.gen_range(0..EIGHT_BALL.len())].to_string())
            }
            CommandKind::Dice { count, faces, bias } => Command::Dice(DiceRoll {
                count,
                faces,
                bias,
                rolls: (0..count).map(|_| rng.gen_range(1..=faces)).collect(),
            }),
        }
    }
}

/// `#flip`, `#8ball` or `#[N]dM[+-B]`.
fn parse_command(token: &str) -> Option<CommandKind> {
    let body = token.strip_prefix('#')?;
    match body {
        "flip" => return Some(CommandKind::Flip),
        "8ball" => return Some(CommandKind::EightBall),
        _ => {}
    }
    let (count, rest) = body.split_once('d')?;
    let count: u8 = match count {
        "" => 1,
        c if c.len() <= 2 && c.bytes().all(|b| b.is_ascii_digit()) => c.parse().ok()?,
        _ => return None,
    };
    let (faces, bias) = match rest.find(['+', '-']) {
        Some(i) => {
            let (f, b) = rest.split_at(i);
            let sign: i16 = if b.starts_with('-') { -1 } else { 1 };
            let digits = &b[1..];
            if digits.is_empty() || digits.len() > 4 || !digits.bytes().all(|c| c.is_ascii_digit()) {
                return None;
            }
            (f, sign * digits.parse::<i16>().ok()?)
        }
        None => (rest, 0),
    };
    if faces.is_empty() || faces.len() > 4 || !faces.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let faces: u16 = faces.parse().ok()?;
    if count == 0 || count > MAX_DICE || !(2..=MAX_FACES).contains(&faces) {
        return None;
    }
    Some(CommandKind::Dice { count, faces, bias })
}
