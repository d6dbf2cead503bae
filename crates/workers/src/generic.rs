//! Template worker showing the shape of a pipeline stage

use frame_pipeline_core::{
    parse_params, Item, Outputs, Params, Worker, WorkerContext, WorkerError,
};
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GenericParams {
    config_param1: Option<serde_json::Value>,
    config_param2: Option<serde_json::Value>,
}

/// Tags every item with `example_field` and passes it on
///
/// Used as a source it emits nothing and finishes immediately.
#[derive(Debug, Default)]
pub struct GenericWorker {
    name: String,
    params: GenericParams,
}

impl Worker for GenericWorker {
    fn initialize(&mut self, ctx: &WorkerContext, params: &Params) -> Result<(), WorkerError> {
        self.name = ctx.name.clone();
        self.params = parse_params(params)?;
        info!(
            worker = %self.name,
            "Initialized with params: {:?}, {:?}",
            self.params.config_param1,
            self.params.config_param2
        );
        Ok(())
    }

    fn startup(&mut self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        info!(worker = %self.name, "Generic worker startup");
        Ok(())
    }

    fn run(&mut self, item: Option<Item>, out: &Outputs) -> Result<(), WorkerError> {
        let Some(mut item) = item else {
            info!(worker = %self.name, "No item provided (source worker), nothing to emit");
            return Ok(());
        };

        debug!(
            worker = %self.name,
            frame_number = ?item.frame_number(),
            "Processing item"
        );
        item.insert("example_field", "example_value");
        out.done_with_item(item)
    }

    fn shutdown(&mut self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        info!(worker = %self.name, "Generic worker shutdown");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{capture, context, emitted, params};
    use serde_json::json;

    #[test]
    fn test_adds_example_field() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context("generic", false, dir.path());
        let mut worker = GenericWorker::default();
        worker
            .initialize(&ctx, &params(json!({"config_param1": 5})))
            .unwrap();

        let (out, rx) = capture("generic");
        worker
            .run(Some(Item::new().with("frame_number", 1i64)), &out)
            .unwrap();

        let items = emitted(&rx);
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].get_json("example_field"),
            Some(&json!("example_value"))
        );
    }

    #[test]
    fn test_source_mode_emits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context("generic", true, dir.path());
        let mut worker = GenericWorker::default();
        worker.initialize(&ctx, &Params::new()).unwrap();

        let (out, rx) = capture("generic");
        worker.run(None, &out).unwrap();
        assert!(emitted(&rx).is_empty());
    }
}
