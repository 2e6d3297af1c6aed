use crate::extractor::{missing_fields, required_questions_for_missing, update_spec_from_message};
use crate::models::{BaselineMatch, BaselinePhase, DesignSpec, HistoryEntry, LockPhase, SessionState};

pub const WORKFLOW_SYSTEM_PROMPT: &str = "\
You are a senior packaging engineer assistant for \"AI-Powered Intelligent Pack Design\".
Follow this strict state machine and never skip steps.

STEP 1: Understand user intent. Collect product type, approx size/volume, intended material, closure type, design style.
Ask minimal clarifying questions only for missing critical fields.

STEP 2: Normalize into structured spec internally. Never show JSON unless user asks.
Never guess dimensions. If unknown, ask clearly.

STEP 3: Baseline search decision. Say exactly one of:
\"Searching for a similar baseline design…\"
or
\"No close baseline found. Creating a new concept.\"
Only decision output for this step.

STEP 4: 2D design iteration only. Use existing 2D visual as reference.
For requested changes, refine consistently and do not restart design.
Do not discuss CAD generation in this step.

STEP 5: Design lock confirmation. Ask the user to lock the current 2D design before CAD generation.

STEP 6: CAD readiness. Once the design is locked, guide the user to generate the STEP CAD model.

STEP 7: Final output. Confirm the STEP CAD model is generated and available for download.

Behavior:
- Act as a senior packaging engineer, not a generic chatbot.
- Never hallucinate dimensions.
- Keep questions minimal and focused.
- Never jump ahead of current workflow step.";

/// Bit-exact protocol strings for the baseline decision. Tests and the
/// polish-skip logic match on these literally.
pub const BASELINE_SEARCH_MSG: &str = "Searching for a similar baseline design…";
pub const BASELINE_NEW_MSG: &str = "No close baseline found. Creating a new concept.";

pub const LOCK_QUESTION: &str =
    "Current 2D design looks ready. Reply confirm to lock it for STEP CAD generation, or continue iterating.";

const LOCK_KEYWORDS: [&str; 4] = ["lock", "final", "ready", "freeze"];
const CONFIRM_WORDS: [&str; 7] =
    ["yes", "confirm", "lock", "proceed", "go ahead", "approve", "confirmed"];

/// Classifies every assistant reply so downstream layers can reason about it
/// without string comparison. `Decision` replies are strict protocol output
/// and are never LLM-polished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Prompt,
    Decision,
    Transition,
    Info,
}

impl MessageKind {
    pub fn preserve_verbatim(self) -> bool {
        matches!(self, MessageKind::Decision)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssistantReply {
    pub text: String,
    pub kind: MessageKind,
}

impl AssistantReply {
    fn new(kind: MessageKind, text: impl Into<String>) -> Self {
        Self { text: text.into(), kind }
    }
}

/// UI/API capability flags, derived every turn and never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityFlags {
    pub can_generate_image: bool,
    pub can_iterate_image: bool,
    pub can_lock: bool,
    pub can_generate_cad: bool,
}

pub fn capability_flags(state: &SessionState) -> CapabilityFlags {
    CapabilityFlags {
        can_generate_image: state.step >= 3 && state.images.is_empty(),
        can_iterate_image: state.step >= 4 && !state.images.is_empty() && !state.locked(),
        can_lock: state.step == 5 && state.lock == LockPhase::Asked,
        can_generate_cad: state.step >= 6 && state.locked() && state.cad_code.is_none(),
    }
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub reply: Option<AssistantReply>,
    pub flags: CapabilityFlags,
}

fn is_confirm(message: &str) -> bool {
    let low = message.to_lowercase();
    CONFIRM_WORDS.iter().any(|w| low.contains(w))
}

fn wants_lock(message: &str) -> bool {
    let low = message.to_lowercase();
    LOCK_KEYWORDS.iter().any(|w| low.contains(w))
}

/// Advances the 7-step workflow by one user turn. The machine itself does no
/// I/O: the baseline lookup is injected and invoked at most once, on the
/// first entry into step 3. Out-of-vocabulary input never errors; the state
/// simply stays put with an acknowledgment.
pub fn handle_chat_turn(
    state: &mut SessionState,
    user_message: &str,
    find_baseline: impl FnOnce(&DesignSpec) -> Vec<BaselineMatch>,
) -> TurnOutcome {
    state.history.push(HistoryEntry::new("user", user_message));
    update_spec_from_message(&mut state.spec, user_message);
    state.missing_fields = missing_fields(&state.spec);
    state.required_questions = required_questions_for_missing(&state.missing_fields);

    let mut reply: Option<AssistantReply> = None;

    if state.step <= 2 {
        if !state.missing_fields.is_empty() {
            state.step = 1;
            let mut text = format!("To continue, I need: {}.", state.missing_fields.join(", "));
            for question in state.required_questions.iter().take(2) {
                text.push(' ');
                text.push_str(question);
            }
            reply = Some(AssistantReply::new(MessageKind::Prompt, text));
        } else {
            state.step = 3;
        }
    }

    if state.step == 3 && !state.baseline.is_decided() {
        let matches = find_baseline(&state.spec);
        let selected_still_ranked = state.baseline_asset.as_ref().is_some_and(|asset| {
            matches.iter().any(|m| m.asset_rel_path == asset.asset_rel_path)
        });
        if !selected_still_ranked {
            state.baseline_asset = None;
        }
        let message = if matches.is_empty() { BASELINE_NEW_MSG } else { BASELINE_SEARCH_MSG };
        state.baseline_matches = matches;
        state.baseline = BaselinePhase::Decided { message: message.to_string() };
        reply = Some(AssistantReply::new(MessageKind::Decision, message));
    } else if state.step == 3 && state.baseline.is_decided() {
        state.step = 4;
        reply = Some(AssistantReply::new(
            MessageKind::Transition,
            "Baseline decision is complete. Use Generate 2D Concept to create the first visual reference.",
        ));
    } else if state.step == 4 {
        if state.images.is_empty() {
            reply = Some(AssistantReply::new(
                MessageKind::Prompt,
                "Please generate the first 2D concept image so we can start visual iteration.",
            ));
        } else if wants_lock(user_message) {
            state.step = 5;
            state.lock = LockPhase::Asked;
            reply = Some(AssistantReply::new(MessageKind::Prompt, LOCK_QUESTION));
        } else {
            reply = Some(AssistantReply::new(
                MessageKind::Info,
                "I captured your iteration request. Use Iterate Design to refine the current 2D reference while preserving design consistency.",
            ));
        }
    } else if state.step == 5 {
        if state.lock == LockPhase::Asked && is_confirm(user_message) {
            state.lock = LockPhase::Confirmed;
            state.step = 6;
            reply = Some(AssistantReply::new(
                MessageKind::Transition,
                "Design locked. STEP CAD generation is now enabled.",
            ));
        } else if state.lock == LockPhase::NotAsked {
            state.lock = LockPhase::Asked;
            reply = Some(AssistantReply::new(MessageKind::Prompt, LOCK_QUESTION));
        } else {
            reply = Some(AssistantReply::new(
                MessageKind::Info,
                "Understood. Continue iterating, or reply confirm when you are ready to lock the design.",
            ));
        }
    } else if state.step == 6 {
        if state.cad_code.is_some() {
            state.step = 7;
            reply = Some(AssistantReply::new(
                MessageKind::Transition,
                "STEP CAD model is generated. The code and STEP file are available for download.",
            ));
        } else {
            reply = Some(AssistantReply::new(
                MessageKind::Info,
                "STEP CAD generation is enabled. Use Generate CAD Model to produce the STEP file.",
            ));
        }
    } else if state.step == 7 {
        reply = Some(AssistantReply::new(
            MessageKind::Info,
            "Final STEP CAD model is available.",
        ));
    }

    if let Some(assistant) = &reply {
        state.history.push(HistoryEntry::new("assistant", &assistant.text));
    }

    TurnOutcome { flags: capability_flags(state), reply }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ImageVersion;
    use pretty_assertions::assert_eq;

    fn sample_match(rel: &str) -> BaselineMatch {
        BaselineMatch {
            asset_path: format!("/assets/{rel}"),
            asset_rel_path: rel.to_string(),
            filename: rel.to_string(),
            product_type: Some("jar".to_string()),
            material: Some("pp".to_string()),
            closure_type: Some("screw".to_string()),
            design_style: Some("minimal".to_string()),
            size_or_volume: Some("50 ml".to_string()),
            summary: None,
            tags: None,
            score: 7,
        }
    }

    fn sample_image(version: u32) -> ImageVersion {
        ImageVersion {
            image_id: format!("img-{version}"),
            image_url_or_base64: "data:image/png;base64,xyz".to_string(),
            version,
            prompt: "concept".to_string(),
            local_image_path: None,
        }
    }

    fn no_baseline(_spec: &DesignSpec) -> Vec<BaselineMatch> {
        Vec::new()
    }

    #[test]
    fn missing_fields_keep_session_at_step_one() {
        let mut state = SessionState::new("s1");
        let outcome = handle_chat_turn(&mut state, "I want a jar", no_baseline);
        assert_eq!(state.step, 1);
        let reply = outcome.reply.expect("reply");
        assert_eq!(reply.kind, MessageKind::Prompt);
        assert!(reply.text.starts_with("To continue, I need: "));
        assert!(!outcome.flags.can_generate_image);
        // At most 2 clarifying questions are appended.
        let question_marks = reply.text.matches('?').count();
        assert!(question_marks <= 2, "too many questions: {}", reply.text);
    }

    #[test]
    fn complete_spec_reaches_baseline_decision_in_one_turn() {
        let mut state = SessionState::new("s1");
        let outcome = handle_chat_turn(
            &mut state,
            "I want a 50 ml PP jar with screw cap, minimal style",
            |_spec| vec![sample_match("jars/minimal_pp.png")],
        );
        assert_eq!(state.step, 3);
        assert!(state.missing_fields.is_empty());
        let reply = outcome.reply.expect("reply");
        assert_eq!(reply.kind, MessageKind::Decision);
        assert_eq!(reply.text, BASELINE_SEARCH_MSG);
        assert_eq!(state.baseline.decision_message(), Some(BASELINE_SEARCH_MSG));
        assert_eq!(state.baseline_matches.len(), 1);
        assert!(outcome.flags.can_generate_image);
    }

    #[test]
    fn empty_catalog_emits_new_concept_decision() {
        let mut state = SessionState::new("s1");
        let outcome = handle_chat_turn(
            &mut state,
            "I want a 50 ml PP jar with screw cap, minimal style",
            no_baseline,
        );
        assert_eq!(outcome.reply.expect("reply").text, BASELINE_NEW_MSG);
    }

    #[test]
    fn baseline_decision_is_one_shot() {
        let mut state = SessionState::new("s1");
        handle_chat_turn(
            &mut state,
            "I want a 50 ml PP jar with screw cap, minimal style",
            no_baseline,
        );
        let mut called = false;
        let outcome = handle_chat_turn(&mut state, "ok what now", |_spec| {
            called = true;
            Vec::new()
        });
        assert!(!called, "matcher must not re-run after the decision");
        assert_eq!(state.step, 4);
        assert_eq!(outcome.reply.expect("reply").kind, MessageKind::Transition);
    }

    #[test]
    fn step_four_without_images_prompts_generation() {
        let mut state = SessionState::new("s1");
        state.step = 4;
        state.baseline = BaselinePhase::Decided { message: BASELINE_NEW_MSG.to_string() };
        // A filled spec keeps intake from re-triggering.
        state.spec.product_type = Some("jar".to_string());
        state.spec.size_or_volume = Some("50 ml".to_string());
        state.spec.intended_material = Some("pp".to_string());
        state.spec.closure_type = Some("screw".to_string());
        state.spec.design_style = Some("minimal".to_string());

        let outcome = handle_chat_turn(&mut state, "looks good", no_baseline);
        assert_eq!(state.step, 4);
        let reply = outcome.reply.expect("reply");
        assert_eq!(reply.kind, MessageKind::Prompt);
        assert!(reply.text.contains("generate the first 2D concept image"));
    }

    fn state_at_step_four_with_image() -> SessionState {
        let mut state = SessionState::new("s1");
        state.step = 4;
        state.baseline = BaselinePhase::Decided { message: BASELINE_NEW_MSG.to_string() };
        state.spec.product_type = Some("jar".to_string());
        state.spec.size_or_volume = Some("50 ml".to_string());
        state.spec.intended_material = Some("pp".to_string());
        state.spec.closure_type = Some("screw".to_string());
        state.spec.design_style = Some("minimal".to_string());
        state.images.push(sample_image(1));
        state
    }

    #[test]
    fn lock_keyword_advances_to_lock_question() {
        let mut state = state_at_step_four_with_image();
        let outcome = handle_chat_turn(&mut state, "this is final, lock it", no_baseline);
        assert_eq!(state.step, 5);
        assert_eq!(state.lock, LockPhase::Asked);
        let reply = outcome.reply.expect("reply");
        assert_eq!(reply.text, LOCK_QUESTION);
        assert!(outcome.flags.can_lock);
    }

    #[test]
    fn iteration_request_acknowledged_without_advance() {
        let mut state = state_at_step_four_with_image();
        let outcome = handle_chat_turn(&mut state, "please widen the shoulder", no_baseline);
        assert_eq!(state.step, 4);
        assert_eq!(outcome.reply.expect("reply").kind, MessageKind::Info);
        assert!(outcome.flags.can_iterate_image);
    }

    #[test]
    fn confirm_after_lock_question_locks_design() {
        let mut state = state_at_step_four_with_image();
        handle_chat_turn(&mut state, "lock it", no_baseline);
        let outcome = handle_chat_turn(&mut state, "confirm", no_baseline);
        assert_eq!(state.step, 6);
        assert_eq!(state.lock, LockPhase::Confirmed);
        assert!(state.locked());
        assert_eq!(outcome.reply.expect("reply").kind, MessageKind::Transition);
        assert!(outcome.flags.can_generate_cad);
        assert!(!outcome.flags.can_iterate_image);
    }

    #[test]
    fn non_confirm_reply_stays_at_step_five() {
        let mut state = state_at_step_four_with_image();
        handle_chat_turn(&mut state, "lock it", no_baseline);
        let outcome = handle_chat_turn(&mut state, "tweak the shoulder a bit more", no_baseline);
        assert_eq!(state.step, 5);
        assert_eq!(state.lock, LockPhase::Asked);
        assert_eq!(outcome.reply.expect("reply").kind, MessageKind::Info);
    }

    #[test]
    fn step_six_reports_cad_enabled_until_artifacts_exist() {
        let mut state = state_at_step_four_with_image();
        handle_chat_turn(&mut state, "lock it", no_baseline);
        handle_chat_turn(&mut state, "confirm", no_baseline);
        let outcome = handle_chat_turn(&mut state, "what next", no_baseline);
        assert_eq!(state.step, 6);
        assert_eq!(outcome.reply.expect("reply").kind, MessageKind::Info);

        state.cad_code = Some("import cadquery as cq".to_string());
        let outcome = handle_chat_turn(&mut state, "and now?", no_baseline);
        assert_eq!(state.step, 7);
        assert_eq!(outcome.reply.expect("reply").kind, MessageKind::Transition);
        assert!(!outcome.flags.can_generate_cad);
    }

    #[test]
    fn step_never_regresses_across_turns() {
        let mut state = SessionState::new("s1");
        let messages = [
            "I want a 50 ml PP jar with screw cap, minimal style",
            "ok",
            "random chatter",
            "cap height 14 mm",
            "lock it in",
            "confirm",
            "hello again",
        ];
        let mut last_step = state.step;
        for msg in messages {
            handle_chat_turn(&mut state, msg, no_baseline);
            assert!(state.step >= last_step, "step regressed on {msg:?}");
            last_step = state.step;
        }
    }

    #[test]
    fn history_records_user_and_assistant_turns() {
        let mut state = SessionState::new("s1");
        handle_chat_turn(&mut state, "I want a jar", no_baseline);
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[0].role, "user");
        assert_eq!(state.history[1].role, "assistant");
    }

    #[test]
    fn stale_baseline_selection_cleared_on_decision() {
        let mut state = SessionState::new("s1");
        state.baseline_asset = Some(sample_match("gone/old.png"));
        handle_chat_turn(
            &mut state,
            "I want a 50 ml PP jar with screw cap, minimal style",
            |_spec| vec![sample_match("jars/minimal_pp.png")],
        );
        assert!(state.baseline_asset.is_none());
    }

    #[test]
    fn decision_kind_is_the_only_verbatim_kind() {
        assert!(MessageKind::Decision.preserve_verbatim());
        assert!(!MessageKind::Prompt.preserve_verbatim());
        assert!(!MessageKind::Transition.preserve_verbatim());
        assert!(!MessageKind::Info.preserve_verbatim());
    }
}
