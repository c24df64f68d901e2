use portray_contracts::request::{Style, SynthesisRequest};
use serde_json::{json, Map, Value};

/// The six preservation axes declared non-negotiable by the identity lock.
const PRESERVATION_AXES: [&str; 6] = [
    "facial structure and features",
    "skin tone and complexion",
    "apparent age",
    "body type and build",
    "distinguishing features (hair, eyewear, facial hair)",
    "ethnicity",
];

const NEGATIVE_CLAUSE: &str =
    "Avoid blurry, distorted, disfigured, or unrealistic output.";

/// Three-turn identity-lock exchange: reference photos plus the lock block,
/// a fabricated model-role acknowledgment, then the scene instruction. The
/// acknowledgment is template text produced here, not by any model; it
/// biases the final turn toward treating identity as already settled.
pub fn identity_lock_request(request: &SynthesisRequest) -> Value {
    let mut opening_parts = image_parts(request);
    opening_parts.push(json!({ "text": identity_lock_block(request) }));

    let contents = vec![
        json!({ "role": "user", "parts": opening_parts }),
        json!({
            "role": "model",
            "parts": [{ "text": acknowledgment_text(request) }],
        }),
        json!({
            "role": "user",
            "parts": [{ "text": scene_instruction(request) }],
        }),
    ];

    json!({
        "contents": contents,
        "generationConfig": generation_config(request, &["TEXT", "IMAGE"]),
    })
}

/// Single conversational turn: all photos followed by one natural-language
/// paragraph. Image-only output; this shape is closer to what the image
/// models are tuned for and trips safety heuristics less often than the
/// instruction-heavy multi-turn form.
pub fn natural_request(request: &SynthesisRequest) -> Value {
    let mut parts = image_parts(request);
    parts.push(json!({ "text": natural_paragraph(request) }));

    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": generation_config(request, &["IMAGE"]),
    })
}

/// Last-resort prompt: no images attached, identity notes folded in as a
/// textual character description, fixed negative clause, conservative
/// safety settings.
pub fn text_only_request(request: &SynthesisRequest) -> Value {
    let mut prompt = format!("Generate an image: {}.", request.scene_description);
    let notes = request.identity_note_paragraphs();
    if !notes.is_empty() {
        prompt.push_str(&format!(
            " The people in the scene look like this: {}",
            notes.join(" ")
        ));
    }
    if let Some(title) = request.title_text.as_deref() {
        prompt.push_str(&format!(
            " The image must include the literal title text \"{title}\"."
        ));
    }
    if let Some(embedded) = request.embedded_text.as_deref() {
        prompt.push_str(&format!(
            " The image must also render the literal text \"{embedded}\"."
        ));
    }
    if let Some(style) = request.style {
        prompt.push_str(&format!(" Render it as {}.", style_clause(style)));
    }
    if request.premium {
        prompt.push_str(" Render at the highest possible quality and detail.");
    }
    prompt.push(' ');
    prompt.push_str(NEGATIVE_CLAUSE);

    json!({
        "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        "generationConfig": generation_config(request, &["IMAGE"]),
        "safetySettings": conservative_safety_settings(),
    })
}

/// Base image first (the likeness anchor), then references in caller order.
fn image_parts(request: &SynthesisRequest) -> Vec<Value> {
    request
        .all_images()
        .iter()
        .map(|image| image.to_inline_part())
        .collect()
}

fn identity_lock_block(request: &SynthesisRequest) -> String {
    let mut lines = vec![
        "The attached photos show the exact people who must appear in the generated image."
            .to_string(),
    ];
    if request.base_image.is_some() {
        lines.push(
            "The first attached photo is the primary likeness anchor; match that person's \
             appearance above all else."
                .to_string(),
        );
    }

    let labels = request.person_labels();
    let notes = request.identity_note_paragraphs();
    if !labels.is_empty() {
        lines.push("The people shown:".to_string());
        for (idx, label) in labels.iter().enumerate() {
            match notes.get(idx) {
                Some(note) => lines.push(format!("- {label}: {note}")),
                None => lines.push(format!("- {label}")),
            }
        }
    }

    lines.push(format!(
        "You must preserve, for every person: {}.",
        PRESERVATION_AXES.join("; ")
    ));
    lines.push(
        "These are non-negotiable. If the requested scene conflicts with any of them, adapt \
         the scene, never the people."
            .to_string(),
    );
    lines.push("Confirm you understand before generating anything.".to_string());
    lines.join("\n")
}

fn acknowledgment_text(request: &SynthesisRequest) -> String {
    let labels = request.person_labels();
    let who = if labels.is_empty() {
        "the person(s) shown in the photos".to_string()
    } else {
        join_labels(&labels)
    };
    format!(
        "Understood. I will depict {who} exactly as they appear in the attached photos, \
         preserving {}. What scene should I generate?",
        PRESERVATION_AXES.join("; ")
    )
}

fn scene_instruction(request: &SynthesisRequest) -> String {
    let mut text = format!(
        "Generate an image of them: {}.",
        request.scene_description
    );
    text.push_str(
        " Remember: the people must remain exactly as shown in the reference photos; their \
         identity is not negotiable.",
    );
    if let Some(title) = request.title_text.as_deref() {
        text.push_str(&format!(
            " The image must include the literal title text \"{title}\"."
        ));
    }
    if let Some(embedded) = request.embedded_text.as_deref() {
        text.push_str(&format!(
            " The image must also render the literal text \"{embedded}\"."
        ));
    }
    if let Some(style) = request.style {
        text.push_str(&format!(" Render the scene as {}.", style_clause(style)));
    }
    if request.premium {
        text.push_str(" Render at the highest possible quality and detail.");
    }
    text
}

fn natural_paragraph(request: &SynthesisRequest) -> String {
    let labels = request.person_labels();
    let who = if labels.is_empty() {
        "these people".to_string()
    } else {
        join_labels(&labels)
    };
    let mut text = format!(
        "Use the attached photos of {who} and generate an image of them {}. Every person \
         must look exactly like they do in the photos: identical faces, identical skin \
         tones, identical builds.",
        request.scene_description
    );
    let notes = request.identity_note_paragraphs();
    if !notes.is_empty() {
        text.push_str(&format!(" For reference: {}", notes.join(" ")));
    }
    if let Some(title) = request.title_text.as_deref() {
        text.push_str(&format!(" Include the title \"{title}\" in the image."));
    }
    if let Some(embedded) = request.embedded_text.as_deref() {
        text.push_str(&format!(" Also include the text \"{embedded}\"."));
    }
    if let Some(style) = request.style {
        text.push_str(&format!(" Make it look like {}.", style_clause(style)));
    }
    if request.premium {
        text.push_str(" Make it extremely detailed and high quality.");
    }
    text
}

fn style_clause(style: Style) -> &'static str {
    match style {
        Style::Cinematic => "a cinematic film still with dramatic lighting",
        Style::OilPainting => "a classical oil painting",
        Style::Watercolor => "a soft watercolor painting",
        Style::Neon => "a vibrant neon-lit scene",
        Style::ThreeDRender => "a polished 3D render",
        Style::Photorealistic => "a photorealistic scene",
    }
}

/// Low temperature favors consistency over creative variation across all
/// three strategies.
fn generation_config(request: &SynthesisRequest, modalities: &[&str]) -> Value {
    let mut config = Map::new();
    config.insert("temperature".to_string(), json!(0.4));
    config.insert(
        "responseModalities".to_string(),
        Value::Array(
            modalities
                .iter()
                .map(|modality| Value::String((*modality).to_string()))
                .collect(),
        ),
    );
    if request.aspect_ratio.is_some() || request.premium {
        let mut image_config = Map::new();
        if let Some(aspect_ratio) = request.aspect_ratio.as_deref() {
            image_config.insert("aspectRatio".to_string(), json!(aspect_ratio));
        }
        image_config.insert(
            "imageSize".to_string(),
            json!(if request.premium { "2K" } else { "1K" }),
        );
        config.insert("imageConfig".to_string(), Value::Object(image_config));
    }
    Value::Object(config)
}

fn conservative_safety_settings() -> Vec<Value> {
    [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
    ]
    .into_iter()
    .map(|category| {
        json!({
            "category": category,
            "threshold": "BLOCK_MEDIUM_AND_ABOVE",
        })
    })
    .collect()
}

fn join_labels(labels: &[String]) -> String {
    match labels {
        [] => String::new(),
        [only] => only.clone(),
        [first, second] => format!("{first} and {second}"),
        [head @ .., last] => format!("{}, and {last}", head.join(", ")),
    }
}
