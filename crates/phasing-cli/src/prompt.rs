//! Interactive Service selection

use async_trait::async_trait;
use dialoguer::console::Term;
use dialoguer::Select;

use phasing_core::PhasingError;

use crate::coordinator::ServiceChooser;

/// Rows of the selection list shown at once
const VISIBLE_ROWS: usize = 20;

/// Asks the user to pick a Service from a list on the terminal
pub struct PromptChooser;

#[async_trait]
impl ServiceChooser for PromptChooser {
    async fn choose(&self, namespace: &str, services: Vec<String>) -> Result<String, PhasingError> {
        // Write the prompt to stderr so stdout stays clean for the endpoint lines
        let term = Term::stderr();
        if !term.is_term() {
            return Err(PhasingError::Selection(
                "no service given and the terminal is not interactive".to_string(),
            ));
        }

        let prompt = format!("Select a service in namespace {}", namespace);
        tokio::task::spawn_blocking(move || {
            let chosen = Select::new()
                .with_prompt(prompt)
                .items(&services)
                .default(0)
                .max_length(VISIBLE_ROWS)
                .interact_on_opt(&term)
                .map_err(|e| PhasingError::Selection(e.to_string()))?;

            match chosen {
                Some(index) => Ok(services[index].clone()),
                None => Err(PhasingError::Selection("selection cancelled".to_string())),
            }
        })
        .await
        .map_err(|e| PhasingError::Selection(format!("prompt failed: {}", e)))?
    }
}
