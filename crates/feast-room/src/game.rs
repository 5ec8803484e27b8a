//! The pure Memory Feast state machine.
//!
//! ```text
//! Waiting → Placement → Matching ⇄ AddToken → Finished
//! ```
//!
//! Nothing here knows about players, turns-as-people, or timers. Every
//! operation validates its own phase and index and reports failure by
//! returning `false` / `None`; the [`Room`](crate::Room) decides which
//! failures the client gets to hear about.

use std::collections::HashMap;

use feast_protocol::{Phase, PlateView};
use feast_session::{PlateData, StateData};

use crate::config::{max_round_for, MAX_PLATE_COUNT, MIN_PLATE_COUNT};

/// One cell of the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plate {
    pub token_count: u32,
    pub covered: bool,
    pub has_token: bool,
}

impl Plate {
    fn new() -> Self {
        Self {
            token_count: 0,
            covered: true,
            has_token: false,
        }
    }

    pub fn view(&self) -> PlateView {
        PlateView {
            tokens: self.token_count,
            covered: self.covered,
            has_tokens: self.has_token,
        }
    }
}

/// Outcome of a confirmed selection: both plates are now uncovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchReveal {
    pub matched: bool,
    pub plates: [usize; 2],
    pub tokens: [u32; 2],
}

/// A delayed step that was still due when the state was saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStep {
    /// A token went down but the turn never passed.
    AdvancePlacement,
    /// Two plates were uncovered but the verdict never landed.
    Reveal(MatchReveal),
    /// The clock ran out and the penalty was paid, but the turn never
    /// passed.
    TurnPass,
}

/// Board and turn state of one game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameState {
    plates: Vec<Plate>,
    phase: Phase,
    current_turn: usize,
    placement_round: u32,
    max_round: u32,
    time_left: u32,
    turn_time_limit: u32,
    selected: Vec<usize>,
    matched: Vec<usize>,
    last_action_plate: Option<usize>,
}

impl GameState {
    /// A covered, empty board of `plate_count` plates in `Waiting`.
    ///
    /// The caller is responsible for passing a legal (clamped) count.
    pub fn new(plate_count: usize, turn_time_limit: u32) -> Self {
        Self {
            plates: vec![Plate::new(); plate_count],
            phase: Phase::Waiting,
            current_turn: 0,
            placement_round: 1,
            max_round: max_round_for(plate_count),
            time_left: turn_time_limit,
            turn_time_limit,
            selected: Vec::new(),
            matched: Vec::new(),
            last_action_plate: None,
        }
    }

    // -- Accessors ----------------------------------------------------------

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn current_turn(&self) -> usize {
        self.current_turn
    }

    pub fn placement_round(&self) -> u32 {
        self.placement_round
    }

    pub fn max_round(&self) -> u32 {
        self.max_round
    }

    pub fn time_left(&self) -> u32 {
        self.time_left
    }

    pub fn set_time_left(&mut self, seconds: u32) {
        self.time_left = seconds;
    }

    pub fn plates(&self) -> &[Plate] {
        &self.plates
    }

    pub fn plate(&self, index: usize) -> Option<&Plate> {
        self.plates.get(index)
    }

    pub fn selected(&self) -> &[usize] {
        &self.selected
    }

    pub fn matched(&self) -> &[usize] {
        &self.matched
    }

    pub fn last_action_plate(&self) -> Option<usize> {
        self.last_action_plate
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    // -- Transitions --------------------------------------------------------

    /// `Waiting → Placement`. Returns false from any other phase.
    pub fn start(&mut self) -> bool {
        if self.phase != Phase::Waiting {
            return false;
        }
        self.phase = Phase::Placement;
        self.current_turn = 0;
        self.placement_round = 1;
        true
    }

    /// Puts `placement_round` tokens on an empty plate.
    pub fn place_token(&mut self, index: usize) -> bool {
        if self.phase != Phase::Placement {
            return false;
        }
        let round = self.placement_round;
        let Some(plate) = self.plates.get_mut(index) else {
            return false;
        };
        if plate.has_token {
            return false;
        }
        plate.token_count = round;
        plate.has_token = true;
        plate.covered = true;
        self.last_action_plate = Some(index);
        true
    }

    /// Re-covers a single plate.
    pub fn cover_plate(&mut self, index: usize) -> bool {
        match self.plates.get_mut(index) {
            Some(plate) => {
                plate.covered = true;
                true
            }
            None => false,
        }
    }

    /// Passes the placement turn. Returns true once every round is done.
    pub fn advance_placement_turn(&mut self) -> bool {
        self.current_turn = 1 - self.current_turn;
        if self.current_turn == 0 {
            self.placement_round += 1;
        }
        self.placement_round > self.max_round
    }

    /// Enters `Matching` with player 0 to act and a full clock.
    ///
    /// Token balances live on the players; the caller sets them.
    pub fn enter_matching(&mut self) {
        self.phase = Phase::Matching;
        self.current_turn = 0;
        self.time_left = self.turn_time_limit;
        self.selected.clear();
        self.matched.clear();
    }

    /// Toggles `index` in the selection, appending only while fewer than
    /// two plates are selected.
    pub fn select_plate(&mut self, index: usize) -> bool {
        if self.phase != Phase::Matching || index >= self.plates.len() {
            return false;
        }
        if let Some(pos) = self.selected.iter().position(|&i| i == index) {
            self.selected.remove(pos);
            return true;
        }
        if self.selected.len() >= 2 {
            return false;
        }
        self.selected.push(index);
        true
    }

    /// Uncovers the two selected plates and compares their counts.
    ///
    /// `None` unless in `Matching` with exactly two plates selected.
    pub fn confirm_match(&mut self) -> Option<MatchReveal> {
        if self.phase != Phase::Matching {
            return None;
        }
        let &[a, b] = self.selected.as_slice() else {
            return None;
        };
        let tokens = [self.plates[a].token_count, self.plates[b].token_count];
        self.plates[a].covered = false;
        self.plates[b].covered = false;
        Some(MatchReveal {
            matched: tokens[0] == tokens[1],
            plates: [a, b],
            tokens,
        })
    }

    /// Snapshots the selected pair as the plates a token may be added to.
    pub fn enter_add_token_phase(&mut self) {
        self.phase = Phase::AddToken;
        self.matched = self.selected.clone();
    }

    /// Adds one token to a plate of the matched pair.
    ///
    /// The pair is consumed by the first success, so a second add in the
    /// same phase fails.
    pub fn add_token(&mut self, index: usize) -> bool {
        if self.phase != Phase::AddToken || !self.matched.contains(&index) {
            return false;
        }
        let Some(plate) = self.plates.get_mut(index) else {
            return false;
        };
        plate.token_count += 1;
        self.last_action_plate = Some(index);
        self.matched.clear();
        true
    }

    /// Covers every plate and clears per-turn state, back in `Matching`.
    pub fn reset_for_next_turn(&mut self) {
        for plate in &mut self.plates {
            plate.covered = true;
        }
        self.selected.clear();
        self.matched.clear();
        self.last_action_plate = None;
        self.phase = Phase::Matching;
        self.time_left = self.turn_time_limit;
    }

    pub fn advance_matching_turn(&mut self) {
        self.current_turn = 1 - self.current_turn;
        self.reset_for_next_turn();
    }

    /// Whether any token count appears on at least two plates, counted
    /// over the whole board regardless of what players have seen.
    pub fn has_remaining_pairs(&self) -> bool {
        let mut counts: HashMap<u32, usize> = HashMap::new();
        self.plates.iter().any(|plate| {
            let seen = counts.entry(plate.token_count).or_default();
            *seen += 1;
            *seen >= 2
        })
    }

    pub fn finish(&mut self) {
        self.phase = Phase::Finished;
    }

    /// Works out from the board alone whether a delayed step was cut off.
    ///
    /// In `Placement` every completed turn leaves one more token on the
    /// board, so an extra token means the turn never passed. In `Matching`
    /// two uncovered selected plates mean the reveal never resolved, and
    /// an empty clock means a timeout whose turn never passed.
    pub fn pending_step(&self) -> Option<PendingStep> {
        match self.phase {
            Phase::Placement => {
                let placed = self.plates.iter().filter(|p| p.has_token).count();
                let done = (self.placement_round as usize - 1) * 2 + self.current_turn;
                (placed > done).then_some(PendingStep::AdvancePlacement)
            }
            Phase::Matching => {
                if let &[a, b] = self.selected.as_slice() {
                    if !self.plates[a].covered && !self.plates[b].covered {
                        let tokens = [self.plates[a].token_count, self.plates[b].token_count];
                        return Some(PendingStep::Reveal(MatchReveal {
                            matched: tokens[0] == tokens[1],
                            plates: [a, b],
                            tokens,
                        }));
                    }
                }
                (self.time_left == 0).then_some(PendingStep::TurnPass)
            }
            _ => None,
        }
    }

    // -- Persistence --------------------------------------------------------

    pub fn to_data(&self) -> StateData {
        StateData {
            phase: self.phase,
            current_turn: self.current_turn,
            placement_round: self.placement_round,
            max_round: self.max_round,
            time_left: self.time_left,
            plates: self
                .plates
                .iter()
                .map(|p| PlateData {
                    tokens: p.token_count,
                    covered: p.covered,
                    has_tokens: p.has_token,
                })
                .collect(),
            selected_plates: self.selected.clone(),
            matched_plates: self.matched.clone(),
        }
    }

    /// Rebuilds a state from a stored record, rejecting anything that
    /// would break the board invariants.
    pub fn from_data(data: &StateData, turn_time_limit: u32) -> Result<Self, String> {
        let len = data.plates.len();
        if !(MIN_PLATE_COUNT..=MAX_PLATE_COUNT).contains(&len) || len % 2 != 0 {
            return Err(format!("illegal plate count {len}"));
        }
        if data.current_turn > 1 {
            return Err(format!("illegal turn {}", data.current_turn));
        }
        if data.selected_plates.len() > 2 || data.matched_plates.len() > 2 {
            return Err("more than two plates selected".into());
        }
        if let Some(bad) = data
            .selected_plates
            .iter()
            .chain(&data.matched_plates)
            .find(|&&i| i >= len)
        {
            return Err(format!("plate index {bad} out of range"));
        }

        Ok(Self {
            plates: data
                .plates
                .iter()
                .map(|p| Plate {
                    token_count: p.tokens,
                    covered: p.covered,
                    has_token: p.has_tokens,
                })
                .collect(),
            phase: data.phase,
            current_turn: data.current_turn,
            placement_round: data.placement_round.max(1),
            max_round: max_round_for(len),
            time_left: data.time_left,
            turn_time_limit,
            selected: data.selected_plates.clone(),
            matched: data.matched_plates.clone(),
            last_action_plate: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placed(plate_count: usize) -> GameState {
        let mut game = GameState::new(plate_count, 60);
        assert!(game.start());
        game
    }

    /// Plays out placement on a 4-plate board: plates 0 and 1 get 1 token.
    fn matching_board() -> GameState {
        let mut game = placed(4);
        assert!(game.place_token(0));
        assert!(!game.advance_placement_turn());
        assert!(game.place_token(1));
        assert!(game.advance_placement_turn());
        game.enter_matching();
        game
    }

    #[test]
    fn test_new_board_is_covered_and_empty() {
        let game = GameState::new(6, 60);
        assert_eq!(game.phase(), Phase::Waiting);
        assert_eq!(game.plates().len(), 6);
        assert_eq!(game.max_round(), 2);
        assert!(game.plates().iter().all(|p| p.covered && !p.has_token));
    }

    #[test]
    fn test_place_token_sets_round_value_once() {
        let mut game = placed(6);
        assert!(game.place_token(2));
        assert_eq!(game.plate(2).map(|p| p.token_count), Some(1));
        assert_eq!(game.last_action_plate(), Some(2));
        assert!(!game.place_token(2), "second placement on same plate");
        assert!(!game.place_token(6), "out of range");
    }

    #[test]
    fn test_place_token_outside_placement_rejected() {
        let mut game = GameState::new(4, 60);
        assert!(!game.place_token(0));
    }

    #[test]
    fn test_advance_placement_increments_round_on_wrap() {
        let mut game = placed(6);
        assert!(!game.advance_placement_turn());
        assert_eq!((game.current_turn(), game.placement_round()), (1, 1));
        assert!(!game.advance_placement_turn());
        assert_eq!((game.current_turn(), game.placement_round()), (0, 2));
        assert!(!game.advance_placement_turn());
        assert!(game.advance_placement_turn());
    }

    #[test]
    fn test_select_plate_toggles_and_caps_at_two() {
        let mut game = matching_board();
        assert!(game.select_plate(0));
        assert!(game.select_plate(0));
        assert!(game.selected().is_empty());

        assert!(game.select_plate(0));
        assert!(game.select_plate(3));
        assert!(!game.select_plate(2), "third distinct plate");
        assert_eq!(game.selected(), &[0, 3]);
        assert!(game.select_plate(3), "deselect still allowed at two");
    }

    #[test]
    fn test_confirm_match_needs_two_and_uncovers() {
        let mut game = matching_board();
        game.select_plate(0);
        assert!(game.confirm_match().is_none());

        game.select_plate(1);
        let reveal = game.confirm_match().unwrap();
        assert!(reveal.matched);
        assert_eq!(reveal.plates, [0, 1]);
        assert_eq!(reveal.tokens, [1, 1]);
        assert!(!game.plate(0).unwrap().covered);
        assert!(!game.plate(1).unwrap().covered);
    }

    #[test]
    fn test_confirm_mismatch_reports_both_counts() {
        let mut game = matching_board();
        game.select_plate(0);
        game.select_plate(2);
        let reveal = game.confirm_match().unwrap();
        assert!(!reveal.matched);
        assert_eq!(reveal.tokens, [1, 0]);
    }

    #[test]
    fn test_add_token_only_once_per_matched_pair() {
        let mut game = matching_board();
        game.select_plate(0);
        game.select_plate(1);
        game.confirm_match();
        game.enter_add_token_phase();
        assert_eq!(game.phase(), Phase::AddToken);

        assert!(!game.add_token(2), "not in matched pair");
        assert!(game.add_token(1));
        assert_eq!(game.plate(1).unwrap().token_count, 2);
        assert!(!game.add_token(1));
        assert!(!game.add_token(0));
        assert!(game.matched().is_empty());
    }

    #[test]
    fn test_advance_matching_turn_resets_board() {
        let mut game = matching_board();
        game.select_plate(0);
        game.select_plate(1);
        game.confirm_match();
        game.set_time_left(12);

        game.advance_matching_turn();

        assert_eq!(game.current_turn(), 1);
        assert_eq!(game.phase(), Phase::Matching);
        assert_eq!(game.time_left(), 60);
        assert!(game.selected().is_empty());
        assert!(game.last_action_plate().is_none());
        assert!(game.plates().iter().all(|p| p.covered));
    }

    #[test]
    fn test_has_remaining_pairs_false_iff_all_counts_unique() {
        let mut game = GameState::new(4, 60);
        assert!(game.has_remaining_pairs(), "four empty plates");

        for (i, plate) in game.plates.iter_mut().enumerate() {
            plate.token_count = i as u32;
        }
        assert!(!game.has_remaining_pairs());

        game.plates[3].token_count = 0;
        assert!(game.has_remaining_pairs());
    }

    #[test]
    fn test_data_round_trip_preserves_board() {
        let mut game = matching_board();
        game.select_plate(1);
        let restored = GameState::from_data(&game.to_data(), 60).unwrap();
        assert_eq!(restored.plates(), game.plates());
        assert_eq!(restored.selected(), &[1]);
        assert_eq!(restored.phase(), Phase::Matching);
    }

    #[test]
    fn test_pending_step_detects_unpassed_placement() {
        let mut game = placed(6);
        assert_eq!(game.pending_step(), None);

        assert!(game.place_token(0));
        assert_eq!(game.pending_step(), Some(PendingStep::AdvancePlacement));

        assert!(!game.advance_placement_turn());
        assert_eq!(game.pending_step(), None);
        assert!(game.place_token(1));
        assert!(!game.advance_placement_turn());
        assert_eq!(game.pending_step(), None, "round 2, turn 0, two tokens down");
    }

    #[test]
    fn test_pending_step_detects_unresolved_reveal() {
        let mut game = matching_board();
        game.select_plate(0);
        game.select_plate(2);
        assert_eq!(game.pending_step(), None, "selected but still covered");

        let reveal = game.confirm_match().unwrap();
        let restored = GameState::from_data(&game.to_data(), 60).unwrap();
        assert_eq!(restored.pending_step(), Some(PendingStep::Reveal(reveal)));

        game.advance_matching_turn();
        assert_eq!(game.pending_step(), None);
    }

    #[test]
    fn test_pending_step_detects_expired_clock() {
        let mut game = matching_board();
        assert_eq!(game.pending_step(), None);
        game.set_time_left(0);
        assert_eq!(game.pending_step(), Some(PendingStep::TurnPass));

        game.advance_matching_turn();
        assert_eq!(game.pending_step(), None, "clock refilled");
    }

    #[test]
    fn test_from_data_rejects_odd_board() {
        let mut data = GameState::new(4, 60).to_data();
        data.plates.pop();
        assert!(GameState::from_data(&data, 60).is_err());
    }

    #[test]
    fn test_from_data_rejects_out_of_range_selection() {
        let mut data = GameState::new(4, 60).to_data();
        data.selected_plates = vec![9];
        assert!(GameState::from_data(&data, 60).is_err());
    }
}
