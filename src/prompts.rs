//! Prompt templates for the reflection pipeline, in English and Japanese.
//!
//! Templates use `{name}` placeholders filled by [`render`]. The locale is
//! selected once from the store configuration (`LOAM_LANG`).

use crate::config::Language;

/// The prompt texts used by the reflection worker.
pub struct PromptSet {
    /// Single-call analysis: decides whether to store, which action to take
    /// (NEW / UPDATE / KEPT), and produces the content. Placeholders:
    /// `{user_input}`, `{agent_output}`, `{existing_docs}`.
    pub unified_analysis: &'static str,
    /// Converts a raw analysis into the structural knowledge-model markdown
    /// form. Placeholder: `{context}`.
    pub knowledge_model: &'static str,
    /// Wrapper for retrieved context handed back to the agent. Placeholder:
    /// `{context_str}`.
    pub retrieved_context: &'static str,
}

impl PromptSet {
    pub fn for_language(language: Language) -> &'static PromptSet {
        match language {
            Language::En => &EN,
            Language::Ja => &JA,
        }
    }
}

/// Fill `{name}` placeholders in `template`.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

pub static EN: PromptSet = PromptSet {
    unified_analysis: r#"Analyze this interaction and decide whether it should be stored in, or
merged into, the knowledge base.

1. **Analysis phase**:
   Extract the important structural knowledge (entities, rules, processes)
   from the interaction. Identify the abstract problem class as well as the
   specific details.

2. **Synthesis phase**:
   Compare the extracted knowledge with the similar existing entries below
   and choose an action:
   - NEW: distinct enough to be a separate entry.
   - UPDATE: adds value to, corrects, or refines an existing entry; merge
     them into a single comprehensive entry.
   - KEPT: redundant or already covered; keep the existing entry as is.

User: {user_input}
AI: {agent_output}

Similar existing knowledge:
{existing_docs}

Output JSON only:
{
    "should_store": true/false,
    "action": "NEW" | "UPDATE" | "KEPT",
    "target_doc_id": null | <integer_id>,
    "analysis": "**Specific Model**:\n[...]\n\n**Generalization**:\n[...]",
    "entities": ["entity1", "entity2"],
    "problem_class": "problem_class",
    "rationale": "Brief reason for the decision"
}
"#,
    knowledge_model: r#"You maintain the long-term memory of an AI system. Transform the analyzed
interaction below into a compact, reusable domain knowledge model.

Output Markdown with exactly these sections:
- **Entities**: the objects and actors involved.
- **State Variables**: the quantities or facts that can change.
- **Actions**: the operations that transform the state.
- **Constraints**: the rules that must always hold.

Keep it general enough to be reusable for other tasks of the same problem
class. Output the Markdown only, without surrounding commentary.

{context}
"#,
    retrieved_context: "--- Retrieved Context ---\n{context_str}\n-----------------------",
};

pub static JA: PromptSet = PromptSet {
    unified_analysis: r#"このやり取りを分析し、知識ベースに保存または更新すべきか判断してください。
出力は必ず日本語（Japanese）で行ってください。

1. **分析フェーズ**:
   やり取りから重要な構造的知識（エンティティ、ルール、プロセス）を抽出してください。
   具体的な詳細だけでなく、抽象的な問題クラスも特定してください。

2. **統合判定フェーズ**:
   抽出した知識と「類似する既存の知識」を比較し、アクションを決定してください。

ユーザー: {user_input}
AI: {agent_output}

類似する既存の知識:
{existing_docs}

Output JSON only:
{
    "should_store": true/false,
    "action": "NEW" | "UPDATE" | "KEPT",
    "target_doc_id": null | <integer_id>,
    "analysis": "**具体的なモデル**:\n[...]\n\n**一般化**:\n[...]",
    "entities": ["entity1", "entity2"],
    "problem_class": "problem_class",
    "rationale": "決定の理由"
}
"#,
    knowledge_model: r#"あなたはAIシステムの長期記憶を管理しています。以下の分析済みのやり取りを、
再利用可能なドメイン知識モデルに変換してください。出力は必ず日本語で行ってください。

次のセクションを持つMarkdownを出力してください:
- **エンティティ**: 関与するオブジェクトと主体。
- **状態変数**: 変化しうる量や事実。
- **アクション**: 状態を変換する操作。
- **制約**: 常に成立すべきルール。

同じ問題クラスの他のタスクでも再利用できる程度に一般化してください。
Markdownのみを出力し、前後の説明は不要です。

{context}
"#,
    retrieved_context: "--- 取得されたコンテキスト ---\n{context_str}\n-----------------------",
};
