use serde::{Deserialize, Serialize};

pub use crate::gemini::generate_content::types::*;
pub use crate::gemini::generate_content::{
    GenerateContentPath, GenerateContentRequest, GenerateContentRequestBody,
    GenerateContentResponse,
};

/// One entry in the native model-list response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub name: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListModelsResponse {
    pub models: Vec<Model>,
}
