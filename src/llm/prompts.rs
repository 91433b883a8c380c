//! Prompt templates sent through the router.

use super::TaskType;

const PLACEHOLDER: &str = "{{source_paragraph}}";

const SIMPLIFY_TEXT_TEMPLATE: &str = "Выступай как учитель, который объясняет сложную идею простым языком. \
Вот блок текста из методики:\n\n\"{{source_paragraph}}\"\n\n\
Преобразуй его в понятное объяснение для школьника.";

const SIMPLIFY_CODE_TEMPLATE: &str = "Выступай как учитель программирования. \
Вот фрагмент кода или технического текста из методики:\n\n{{source_paragraph}}\n\n\
Объясни простыми словами, что он делает, так, чтобы понял школьник. Не переписывай код целиком.";

/// Build the simplification prompt for one scene
pub fn simplify_prompt(text: &str, task: TaskType) -> String {
    let template = match task {
        TaskType::Text => SIMPLIFY_TEXT_TEMPLATE,
        TaskType::Code => SIMPLIFY_CODE_TEMPLATE,
    };
    template.replace(PLACEHOLDER, text.trim())
}

/// Prompt for the image model; Stable Diffusion works best in English
pub fn illustration_prompt(text: &str) -> String {
    format!(
        "Create a simple, clear educational illustration that explains the following concept:\n{}\n\
         Style: Simple, educational, clean background, suitable for teaching",
        text.trim()
    )
}
