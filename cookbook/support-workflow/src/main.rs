//! Classify a customer message, then draft the reply, as a two-step pipeline.
//!
//! Set `LABS_MODEL_ENDPOINT`, `LABS_MODEL_DEPLOYMENT` and `LABS_API_KEY` to
//! run against Azure OpenAI; otherwise a scripted model plays both agents.

use std::env;
use std::sync::Arc;

use agent_labs::tools::{message_formulator_toolkit, ClassifyProblemTool};
use agent_labs::{
    Agent, LanguageModel, ModelConfig, ModelProvider, OpenAIClient, StubModel, Workflow,
};

fn model() -> agent_labs::Result<Arc<dyn LanguageModel>> {
    if let (Ok(endpoint), Ok(deployment), Ok(key)) = (
        env::var("LABS_MODEL_ENDPOINT"),
        env::var("LABS_MODEL_DEPLOYMENT"),
        env::var("LABS_API_KEY"),
    ) {
        let mut cfg = ModelConfig::new(ModelProvider::Azure, deployment.clone());
        cfg.endpoint = Some(endpoint);
        cfg.api_key = Some(key);
        return Ok(Arc::new(OpenAIClient::from_config(&cfg, &deployment)?));
    }

    Ok(StubModel::new(vec![
        r#"{"action":"call_tool","name":"classify_problem","arguments":{"description":"Mon colis n'est jamais arrivé"}}"#.into(),
        r#"{"action":"respond","content":"delivery: le colis n'a pas été livré"}"#.into(),
        r#"{"action":"call_tool","name":"formulate_message","arguments":{"typology":"delivery","description":"le colis n'a pas été livré","customer_name":"Mme Martin"}}"#.into(),
        r#"{"action":"respond","content":"Bonjour Mme Martin, nous avons ouvert une enquête auprès du transporteur."}"#.into(),
    ]))
}

#[tokio::main]
async fn main() -> agent_labs::Result<()> {
    let model = model()?;

    let classifier = Agent::new("classifier", model.clone())
        .with_description("Identifie la typologie du problème.")
        .with_instructions(
            "Classe le message du client avec classify_problem puis résume : `typologie: description`.",
        )
        .with_tool(Arc::new(ClassifyProblemTool));
    let writer = Agent::new("writer", model)
        .with_description("Rédige la réponse au client.")
        .with_instructions("Rédige une réponse courtoise en français avec formulate_message.")
        .with_tools(message_formulator_toolkit());

    let flow = Workflow::sequential("support", vec![Arc::new(classifier), Arc::new(writer)]);
    let outcome = flow
        .run("Bonjour, je suis Mme Martin. Mon colis n'est jamais arrivé.")
        .await?;

    for step in &outcome.steps {
        println!("[{}] {}", step.agent, step.output);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&outcome).unwrap_or_else(|_| outcome.output.clone())
    );
    Ok(())
}
