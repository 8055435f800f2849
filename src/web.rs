//! Browser handle. The host page opens one [`ForgeApp`] and drives the
//! workflow through promises; history persists to `sessionStorage`.

use crate::core::config::{ApiKeys, Config};
use crate::core::error::ForgeError;
use crate::core::io::{Storage, WebSessionStorage};
use crate::core::session::{load_session, session_channel, PersistHook};
use crate::core::state::{ArtStyle, PromptSpec};
use crate::services::workflow::ForgeWorkflow;
use js_sys::Promise;
use log::{info, warn};
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::{future_to_promise, spawn_local};

fn to_js(err: ForgeError) -> JsValue {
    warn!("Request failed: {}", err);
    JsValue::from_str(&err.user_message())
}

fn promise<F, T>(future: F) -> Promise
where
    F: Future<Output = Result<T, ForgeError>> + 'static,
    T: Into<JsValue>,
{
    future_to_promise(async move { future.await.map(Into::into).map_err(to_js) })
}

#[wasm_bindgen]
pub struct ForgeApp {
    workflow: Rc<ForgeWorkflow>,
}

/// Restores the tab's session and starts its writer.
#[wasm_bindgen(js_name = openApp)]
pub async fn open_app() -> Result<ForgeApp, JsValue> {
    let config = Config::default();
    let workflow = match WebSessionStorage::new() {
        Ok(storage) => {
            let storage: Arc<dyn Storage> = Arc::new(storage);
            let restored = load_session(storage.as_ref(), "").await;
            let (persister, writer) = session_channel(storage, "");
            spawn_local(writer.run());
            let hook: Arc<dyn PersistHook> = Arc::new(persister);
            ForgeWorkflow::from_config(&config).with_session(restored, Some(hook))
        }
        Err(e) => {
            warn!("Running without session persistence: {:#}", e);
            ForgeWorkflow::from_config(&config)
        }
    };
    info!("charforge ready");
    Ok(ForgeApp {
        workflow: Rc::new(workflow),
    })
}

#[wasm_bindgen]
impl ForgeApp {
    #[wasm_bindgen(js_name = setApiKeys)]
    pub fn set_api_keys(&self, gemini: Option<String>, elevenlabs: Option<String>) {
        self.workflow.set_api_keys(ApiKeys {
            gemini: gemini.filter(|k| !k.trim().is_empty()),
            elevenlabs: elevenlabs.filter(|k| !k.trim().is_empty()),
        });
    }

    /// History, newest first, as JSON.
    #[wasm_bindgen(js_name = recordsJson)]
    pub fn records_json(&self) -> Result<String, JsValue> {
        serde_json::to_string(&self.workflow.records()).map_err(|e| JsValue::from_str(&e.to_string()))
    }

    /// Resolves to the new record id.
    pub fn generate(&self, character: String, scene: String, style: String, with_dossier: bool) -> Promise {
        let workflow = self.workflow.clone();
        promise(async move {
            let style = ArtStyle::from_label(&style)
                .ok_or_else(|| ForgeError::contract(format!("unknown art style {:?}", style)))?;
            let outcome = workflow
                .generate(PromptSpec::new(character, scene, style), with_dossier)
                .await?;
            if let Some(e) = &outcome.dossier_error {
                warn!("Dossier for {} failed: {}", outcome.record_id, e);
            }
            Ok(outcome.record_id)
        })
    }

    #[wasm_bindgen(js_name = generateDossier)]
    pub fn generate_dossier(&self, record_id: String) -> Promise {
        let workflow = self.workflow.clone();
        promise(async move {
            workflow.generate_dossier(&record_id).await?;
            Ok(JsValue::UNDEFINED)
        })
    }

    /// Resolves to the number of images added.
    #[wasm_bindgen(js_name = generateVariations)]
    pub fn generate_variations(&self, record_id: String) -> Promise {
        let workflow = self.workflow.clone();
        promise(async move { Ok(workflow.generate_variations(&record_id).await? as u32) })
    }

    /// Resolves to the foil's record id.
    #[wasm_bindgen(js_name = generateFoil)]
    pub fn generate_foil(&self, original_id: String) -> Promise {
        let workflow = self.workflow.clone();
        promise(async move { workflow.generate_foil(&original_id).await })
    }

    /// Resolves to the story text.
    #[wasm_bindgen(js_name = generateOriginStory)]
    pub fn generate_origin_story(&self, record_id: String) -> Promise {
        let workflow = self.workflow.clone();
        promise(async move { workflow.generate_origin_story(&record_id).await })
    }

    #[wasm_bindgen(js_name = updateTitle)]
    pub fn update_title(&self, record_id: String, title: String) {
        self.workflow.update_title(&record_id, &title);
    }

    #[wasm_bindgen(js_name = undoVersion)]
    pub fn undo_version(&self, image_id: String) -> Result<bool, JsValue> {
        self.workflow.undo_version(&image_id).map_err(to_js)
    }
}
