use std::sync::Arc;

use agent_labs::{AppConfig, LabRuntime, StaticApproval, StubModel, WorkflowEvent};

const CONFIG: &str = r#"
[model]
provider = "stub"
deployment = "stub"

[[agents]]
id = "billing"
description = "Questions de facturation, paiements et remboursements."
instructions = "Tu es le service facturation."

[[agents]]
id = "delivery"
description = "Suivi des colis et problèmes de livraison."
instructions = "Tu es le service logistique."

[[agents]]
id = "triage"
description = "Premier contact."
instructions = "Oriente la demande vers le bon service."
handoffs = ["billing", "delivery"]

[[agents]]
id = "writer"
description = "Rédige les messages aux clients."
instructions = "Rédige."
tools = ["formulate_message"]
requires_approval = ["formulate_message"]

[[workflows]]
name = "second-opinion"
mode = "concurrent"
agents = ["billing", "delivery"]
"#;

async fn runtime(model: Arc<StubModel>) -> LabRuntime {
    LabRuntime::builder(AppConfig::parse(CONFIG).unwrap())
        .with_model(model)
        .with_confirmation_handler(Arc::new(StaticApproval(false)))
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn concurrent_workflow_reports_every_step() {
    let model = StubModel::new(vec!["Rien à facturer.".into(), "Colis en route.".into()]);
    let runtime = runtime(model).await;
    let mut events = runtime.subscribe();

    let outcome = runtime
        .workflow("second-opinion")
        .unwrap()
        .run("où en est ma commande ?")
        .await
        .unwrap();

    assert!(outcome.output.starts_with("[billing]\n"));
    assert!(outcome.output.contains("\n\n[delivery]\n"));
    assert_eq!(outcome.steps.len(), 2);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen.len(), 4);
    assert!(matches!(seen.first(), Some(WorkflowEvent::Started { .. })));
    assert!(matches!(seen.last(), Some(WorkflowEvent::Completed { .. })));
}

#[tokio::test]
async fn triage_routes_through_specialist_tools() {
    let model = StubModel::new(vec![
        r#"{"action":"call_tool","name":"ask_delivery","arguments":{"query":"colis en retard"}}"#
            .into(),
        "Le transporteur livre demain.".into(),
        r#"{"action":"respond","content":"Votre colis sera livré demain."}"#.into(),
    ]);
    let runtime = runtime(model.clone()).await;

    let turn = runtime
        .chat()
        .chat("triage", "mon colis a du retard", None)
        .await
        .unwrap();

    assert_eq!(turn.reply, "Votre colis sera livré demain.");
    let requests = model.requests();
    assert_eq!(requests[0].tools, vec!["ask_billing", "ask_delivery"]);
    assert_eq!(
        requests[1].messages[0].content,
        "Tu es le service logistique."
    );
    let tool_output = &requests[2].messages[3];
    assert!(tool_output.content.contains("Le transporteur livre demain."));
}

#[tokio::test]
async fn operator_rejection_reaches_the_model() {
    let model = StubModel::new(vec![
        r#"{"action":"call_tool","name":"formulate_message","arguments":{"description":"retard"}}"#
            .into(),
        "Envoi annulé par l'opérateur.".into(),
    ]);
    let runtime = runtime(model.clone()).await;

    let turn = runtime
        .chat()
        .chat("writer", "écris au client", None)
        .await
        .unwrap();

    assert_eq!(turn.reply, "Envoi annulé par l'opérateur.");
    let rejected = &model.requests()[1].messages[3];
    assert!(rejected.content.contains("rejected"));
}
