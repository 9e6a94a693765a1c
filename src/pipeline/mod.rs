//! The voice-agent pipeline: orchestrator, synthesis path, playout, human
//! input, and turn-taking.

mod agent;
mod agent_output;
mod agent_playout;
mod human_input;
mod speech_handle;
mod validation;

pub use agent::{
    AgentCallContext, AgentEvent, AgentSpeechSource, BeforeLlmCallback, BeforeLlmResult,
    BeforeTtsCallback, VoicePipelineAgent,
};
pub use agent_output::{tee_text_stream, AgentOutput, SpeechSource, SynthesisHandle, TextStream};
pub use agent_playout::{AgentPlayout, PlayoutEvent, PlayoutHandle};
pub use human_input::{HumanInput, HumanInputEvent};
pub use speech_handle::{LlmSourceInfo, SpeechHandle, SpeechKind, SpeechSourceInfo};
pub use validation::{DeferredReplyValidation, TurnDetector};
