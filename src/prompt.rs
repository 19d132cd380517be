use crate::models::{GenerationRequest, Mode};

impl Mode {
    // Fixed system framing for each mode
    pub fn instruction(self) -> &'static str {
        match self {
            Mode::Chat => {
                "You are a helpful AI assistant. Provide clear, concise, and accurate responses."
            }
            Mode::Analyze => {
                "You are an analytical AI. Analyze the given information and provide insights with confidence levels."
            }
            Mode::Summarize => {
                "You are a summarization AI. Create concise summaries while preserving key information."
            }
        }
    }
}

// Instruction, optional context, then the question, as one upstream message
pub fn compose_prompt(request: &GenerationRequest) -> String {
    let mut prompt = String::from(request.mode.instruction());

    if let Some(context) = request.context.as_deref().filter(|c| !c.is_empty()) {
        prompt.push_str("\n\nContext: ");
        prompt.push_str(context);
    }

    prompt.push_str("\n\nQuestion: ");
    prompt.push_str(&request.question);
    prompt
}
