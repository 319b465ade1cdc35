//! Customer-problem typology for French-language requests.
//!
//! Classification is a keyword table: the request is lowercased and
//! accent-folded, every rule counts the keywords it finds (inflected forms
//! included, overlapping matches once), and the rule
//! with the most matches wins. Ties go to the rule listed first.

use std::fmt;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{LabError, Result};
use crate::tool::{required_str, Tool, ToolRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemTypology {
    Malfunction,
    Delivery,
    Billing,
    Refund,
    Account,
    Information,
    Other,
}

impl ProblemTypology {
    pub const ALL: [ProblemTypology; 7] = [
        ProblemTypology::Malfunction,
        ProblemTypology::Delivery,
        ProblemTypology::Billing,
        ProblemTypology::Refund,
        ProblemTypology::Account,
        ProblemTypology::Information,
        ProblemTypology::Other,
    ];

    /// French label shown to customers.
    pub fn label(self) -> &'static str {
        match self {
            ProblemTypology::Malfunction => "Dysfonctionnement",
            ProblemTypology::Delivery => "Livraison",
            ProblemTypology::Billing => "Facturation",
            ProblemTypology::Refund => "Retour et remboursement",
            ProblemTypology::Account => "Compte client",
            ProblemTypology::Information => "Demande d'information",
            ProblemTypology::Other => "Autre",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let folded = fold(raw.trim());
        Self::ALL.into_iter().find(|typology| {
            let key = serde_json::to_value(typology)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string));
            key.as_deref() == Some(folded.as_str()) || fold(typology.label()) == folded
        })
    }
}

impl fmt::Display for ProblemTypology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Each entry is a keyword and the pattern that matches its inflected
/// forms. Patterns are written lowercase and without accents.
const RULES: &[(ProblemTypology, &[(&str, &str)])] = &[
    (
        ProblemTypology::Malfunction,
        &[
            ("ne fonctionne pas", r"ne (?:fonctionne|fonctionnent) (?:pas|plus)"),
            ("ne marche pas", r"ne (?:marche|marchent) (?:pas|plus)"),
            ("ne s'allume pas", r"ne s'allumen?t? (?:pas|plus)"),
            ("en panne", r"en panne"),
            ("panne", r"pannes?"),
            ("casse", r"cass(?:e|ee|es|ees)"),
            ("defectueux", r"defectueu(?:x|se|ses)"),
            ("defaut", r"defauts?"),
            ("bug", r"bugs?"),
            ("erreur", r"erreurs?"),
            ("plante", r"plant(?:e|ent)"),
            ("bloque", r"bloqu(?:e|ee|es|ees|ent)"),
        ],
    ),
    (
        ProblemTypology::Delivery,
        &[
            ("livraison", r"livraisons?"),
            ("livre", r"livr(?:e|ee|es|ees)"),
            ("colis", r"colis"),
            ("pas recu", r"pas recu(?:e|s|es)?"),
            ("jamais recu", r"jamais recu(?:e|s|es)?"),
            ("toujours pas arrive", r"toujours pas arrive(?:e|s|es)?"),
            ("retard", r"retards?"),
            ("expedition", r"expeditions?"),
            ("expedie", r"expedi(?:e|ee|es|ees)"),
            ("transporteur", r"transporteurs?"),
            ("suivi", r"suivi"),
        ],
    ),
    (
        ProblemTypology::Billing,
        &[
            ("facture deux fois", r"factur(?:e|ee|es|ees) deux fois"),
            ("facture", r"factur(?:e|ee|es|ees)"),
            ("facturation", r"facturations?"),
            ("paiement", r"paiements?"),
            ("prelevement", r"prelevements?"),
            ("preleve", r"prelev(?:e|ee|es|ees)"),
            ("debite", r"debit(?:e|ee|es|ees)"),
            ("montant", r"montants?"),
            ("tarif", r"tarifs?"),
            ("carte bancaire", r"cartes? bancaires?"),
        ],
    ),
    (
        ProblemTypology::Refund,
        &[
            ("remboursement", r"remboursements?"),
            ("rembourser", r"rembourser"),
            ("rembourse", r"rembours(?:e|ee|es|ees)"),
            ("retour", r"retours?"),
            ("retourner", r"retourner"),
            ("echange", r"echanges?"),
            ("echanger", r"echanger"),
            ("annuler", r"annuler"),
            ("annulation", r"annulations?"),
        ],
    ),
    (
        ProblemTypology::Account,
        &[
            ("mot de passe", r"mots? de passe"),
            ("connexion", r"connexions?"),
            ("me connecter", r"me connecter"),
            ("compte", r"comptes?"),
            ("identifiant", r"identifiants?"),
            ("adresse e-mail", r"adresses? (?:e-)?mail"),
        ],
    ),
    (
        ProblemTypology::Information,
        &[
            ("information", r"informations?"),
            ("renseignement", r"renseignements?"),
            ("savoir", r"savoir"),
            ("comment", r"comment"),
            ("question", r"questions?"),
            ("disponible", r"disponibles?"),
            ("disponibilite", r"disponibilites?"),
            ("horaires", r"horaires?"),
        ],
    ),
];

struct CompiledRule {
    typology: ProblemTypology,
    keywords: Vec<(&'static str, Regex)>,
}

fn compiled_rules() -> &'static [CompiledRule] {
    static RULES_CELL: OnceLock<Vec<CompiledRule>> = OnceLock::new();
    RULES_CELL.get_or_init(|| {
        RULES
            .iter()
            .map(|(typology, keywords)| CompiledRule {
                typology: *typology,
                keywords: keywords
                    .iter()
                    .filter_map(|(keyword, pattern)| {
                        Regex::new(&format!(r"\b(?:{pattern})\b"))
                            .ok()
                            .map(|re| (*keyword, re))
                    })
                    .collect(),
            })
            .collect()
    })
}

impl CompiledRule {
    /// Distinct keywords found in `folded`. Where matches overlap only the
    /// longest one counts, so "en panne" is not also scored as "panne".
    fn matches(&self, folded: &str) -> Vec<&'static str> {
        let mut spans: Vec<(usize, usize, &'static str)> = self
            .keywords
            .iter()
            .flat_map(|(keyword, re)| {
                re.find_iter(folded)
                    .map(move |m| (m.start(), m.end(), *keyword))
            })
            .collect();
        spans.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        let mut covered = 0;
        let mut matched = Vec::new();
        for (start, end, keyword) in spans {
            if start < covered {
                continue;
            }
            covered = end;
            if !matched.contains(&keyword) {
                matched.push(keyword);
            }
        }
        matched
    }
}
/// Lowercase and strip French diacritics.
fn fold(text: &str) -> String {
    let mut folded = String::with_capacity(text.len());
    for c in text.chars().flat_map(char::to_lowercase) {
        match c {
            'à' | 'â' | 'ä' => folded.push('a'),
            'é' | 'è' | 'ê' | 'ë' => folded.push('e'),
            'î' | 'ï' => folded.push('i'),
            'ô' | 'ö' => folded.push('o'),
            'ù' | 'û' | 'ü' => folded.push('u'),
            'ç' => folded.push('c'),
            'œ' => folded.push_str("oe"),
            'æ' => folded.push_str("ae"),
            '’' => folded.push('\''),
            other => folded.push(other),
        }
    }
    folded
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub typology: ProblemTypology,
    pub label: &'static str,
    pub matched: Vec<&'static str>,
}

pub fn classify(text: &str) -> Classification {
    let folded = fold(text);
    let mut best: Option<(usize, &CompiledRule, Vec<&'static str>)> = None;

    for rule in compiled_rules() {
        let matched = rule.matches(&folded);
        let score = matched.len();
        if score > 0 && best.as_ref().map_or(true, |(top, _, _)| score > *top) {
            best = Some((score, rule, matched));
        }
    }

    match best {
        Some((_, rule, matched)) => Classification {
            typology: rule.typology,
            label: rule.typology.label(),
            matched,
        },
        None => Classification {
            typology: ProblemTypology::Other,
            label: ProblemTypology::Other.label(),
            matched: Vec::new(),
        },
    }
}

/// Customer-facing message for a problem, in French.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormulatedMessage {
    pub typology: ProblemTypology,
    pub subject: String,
    pub body: String,
}

pub fn formulate(
    typology: ProblemTypology,
    description: &str,
    customer_name: Option<&str>,
) -> FormulatedMessage {
    let greeting = match customer_name.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => format!("Bonjour {name},"),
        None => "Bonjour,".to_string(),
    };
    let next_step = match typology {
        ProblemTypology::Malfunction => {
            "Nous sommes désolés que votre produit ne fonctionne pas correctement. Un technicien va analyser le problème et vous proposer une réparation ou un remplacement."
        }
        ProblemTypology::Delivery => {
            "Nous avons transmis votre demande à notre service logistique, qui va vérifier le suivi de votre colis auprès du transporteur."
        }
        ProblemTypology::Billing => {
            "Notre service facturation va vérifier les montants concernés et revenir vers vous avec une facture corrigée si nécessaire."
        }
        ProblemTypology::Refund => {
            "Votre demande de retour a bien été enregistrée. Le remboursement sera effectué dès réception et contrôle de l'article."
        }
        ProblemTypology::Account => {
            "Pour sécuriser votre compte, nous vous invitons à réinitialiser votre mot de passe depuis la page de connexion. Notre équipe reste disponible si le problème persiste."
        }
        ProblemTypology::Information => {
            "Merci pour votre question. Un conseiller va vous apporter les informations demandées dans les meilleurs délais."
        }
        ProblemTypology::Other => {
            "Votre demande a été transmise à un conseiller qui reviendra vers vous rapidement."
        }
    };
    let body = format!(
        "{greeting}\n\nNous avons bien reçu votre message : « {} ».\n\n{next_step}\n\nCordialement,\nLe service client",
        description.trim()
    );
    FormulatedMessage {
        typology,
        subject: format!("[{}] Suivi de votre demande", typology.label()),
        body,
    }
}

pub struct ClassifyProblemTool;

#[async_trait]
impl Tool for ClassifyProblemTool {
    fn name(&self) -> &str {
        "classify_problem"
    }

    fn description(&self) -> &str {
        "Classify a customer's problem description (French) into a typology: malfunction, delivery, billing, refund, account, information or other."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "description": {"type": "string", "description": "The customer's problem, verbatim."}
            },
            "required": ["description"],
        }))
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let description = required_str(&input, self.name(), "description")?;
        Ok(serde_json::to_value(classify(description))?)
    }
}

pub struct FormulateMessageTool;

#[async_trait]
impl Tool for FormulateMessageTool {
    fn name(&self) -> &str {
        "formulate_message"
    }

    fn description(&self) -> &str {
        "Write the French customer-service reply for a problem. Classifies the description when no typology is given."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "description": {"type": "string"},
                "typology": {
                    "type": "string",
                    "enum": ["malfunction", "delivery", "billing", "refund", "account", "information", "other"]
                },
                "customer_name": {"type": "string"}
            },
            "required": ["description"],
        }))
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let description = required_str(&input, self.name(), "description")?;
        let typology = match input.get("typology").and_then(Value::as_str) {
            Some(raw) => ProblemTypology::parse(raw).ok_or_else(|| {
                LabError::Protocol(format!("unknown typology `{raw}` for formulate_message"))
            })?,
            None => classify(description).typology,
        };
        let customer = input.get("customer_name").and_then(Value::as_str);
        Ok(serde_json::to_value(formulate(typology, description, customer))?)
    }
}

pub fn message_formulator_toolkit() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(ClassifyProblemTool);
    registry.register(FormulateMessageTool);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_literal_examples() {
        let cases = [
            ("le produit ne fonctionne pas", ProblemTypology::Malfunction),
            ("Mon colis n'est toujours pas arrivé", ProblemTypology::Delivery),
            ("J'ai été débité deux fois sur ma facture", ProblemTypology::Billing),
            ("Je voudrais un remboursement pour cet article", ProblemTypology::Refund),
            ("J'ai oublié mon mot de passe", ProblemTypology::Account),
            ("Quels sont vos horaires d'ouverture ?", ProblemTypology::Information),
            ("Bonjour", ProblemTypology::Other),
        ];
        for (text, expected) in cases {
            assert_eq!(classify(text).typology, expected, "{text}");
        }
    }

    #[test]
    fn plural_and_feminine_forms_match() {
        let cases = [
            ("Mes écouteurs ne fonctionnent pas", ProblemTypology::Malfunction),
            ("Mes écouteurs sont cassés", ProblemTypology::Malfunction),
            ("Les deux lampes ne marchent plus", ProblemTypology::Malfunction),
            ("J'ai été prélevée deux fois", ProblemTypology::Billing),
            ("Ma commande a été livrée abîmée", ProblemTypology::Delivery),
            ("Mes factures sont fausses", ProblemTypology::Billing),
        ];
        for (text, expected) in cases {
            assert_eq!(classify(text).typology, expected, "{text}");
        }
        assert_eq!(classify("Elles sont cassées").matched, vec!["casse"]);
    }

    #[test]
    fn overlapping_keywords_count_once() {
        assert_eq!(classify("la machine est en panne").matched, vec!["en panne"]);
        assert_eq!(
            classify("on m'a facturé deux fois").matched,
            vec!["facture deux fois"]
        );
        assert_eq!(
            classify("La livraison du colis : l'appareil est en panne").typology,
            ProblemTypology::Delivery
        );
    }

    #[test]
    fn every_keyword_pattern_compiles() {
        for (rule, (_, keywords)) in compiled_rules().iter().zip(RULES) {
            assert_eq!(rule.keywords.len(), keywords.len(), "{:?}", rule.typology);
        }
    }

    #[test]
    fn accents_and_case_are_ignored() {
        let result = classify("ÉCRAN DÉFECTUEUX");
        assert_eq!(result.typology, ProblemTypology::Malfunction);
        assert_eq!(result.matched, vec!["defectueux"]);
    }

    #[test]
    fn keywords_match_whole_words_only() {
        // "bug" must not match inside "debugger".
        assert_eq!(classify("le debugger intégré").typology, ProblemTypology::Other);
    }

    #[test]
    fn most_matches_wins_and_ties_follow_rule_order() {
        assert_eq!(
            classify("retour du colis en retard, livraison ratée").typology,
            ProblemTypology::Delivery
        );
        assert_eq!(
            classify("colis cassé").typology,
            ProblemTypology::Malfunction
        );
    }

    #[test]
    fn parses_keys_and_labels() {
        assert_eq!(ProblemTypology::parse("delivery"), Some(ProblemTypology::Delivery));
        assert_eq!(ProblemTypology::parse("Facturation"), Some(ProblemTypology::Billing));
        assert_eq!(ProblemTypology::parse("nope"), None);
    }

    #[tokio::test]
    async fn formulate_tool_classifies_when_typology_is_missing() {
        let output = FormulateMessageTool
            .call(json!({"description": "Mon colis est en retard", "customer_name": "Claire"}))
            .await
            .unwrap();
        assert_eq!(output["typology"], "delivery");
        assert!(output["body"].as_str().unwrap().starts_with("Bonjour Claire,"));
        assert_eq!(output["subject"], "[Livraison] Suivi de votre demande");
    }

    #[tokio::test]
    async fn classify_tool_requires_a_description() {
        assert!(ClassifyProblemTool.call(json!({})).await.is_err());
        let output = ClassifyProblemTool
            .call(json!({"description": "écran cassé"}))
            .await
            .unwrap();
        assert_eq!(output["typology"], "malfunction");
        assert_eq!(output["label"], "Dysfonctionnement");
    }
}
