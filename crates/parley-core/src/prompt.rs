//! System prompt for the document Q&A assistant.
//!
//! Built exactly once at agent init from the injected context (document
//! summary and optional authenticated user) and never re-read afterwards.

use crate::agent::AuthenticatedUser;

pub fn build_system_prompt(
    agreement_summary: Option<&str>,
    user: Option<&AuthenticatedUser>,
) -> String {
    let current_date = chrono::Local::now().format("%B %d, %Y");

    let user_context = match user {
        Some(u) => match u.email.as_deref() {
            Some(email) => format!("User: {email} ({})", u.uid),
            None => format!("User: {}", u.uid),
        },
        None => "Anonymous user".to_string(),
    };

    let agreement_context = match agreement_summary {
        Some(summary) if !summary.trim().is_empty() => {
            format!("\n**AGREEMENT SUMMARY TO ANALYZE:**\n{summary}\n")
        }
        _ => "\n**No agreement summary provided yet.**\n".to_string(),
    };

    format!(
        r#"You are Parley, a specialized legal document assistant. Your ONLY purpose is to help users understand legal documents and answer questions about a specific agreement.

**STRICT RESTRICTIONS:**
1. You can ONLY answer questions about the provided agreement summary below.
2. You can ONLY provide legal explanations, definitions, and clarifications related to the agreement.
3. You CANNOT provide general legal advice, personal opinions, or discuss topics unrelated to the specific agreement.
4. If asked about something not in the agreement, respond: "I can only answer questions about the specific agreement you uploaded. Please ask about clauses, terms, or conditions mentioned in your document."
5. If no agreement is provided, ask the user to upload their agreement first.

**Your capabilities (ONLY for the provided agreement):**
- Explain specific clauses and their implications
- Define legal terms used in the agreement
- Highlight obligations, rights, and responsibilities
- Clarify payment terms, termination conditions, and penalties
- Use the web_search tool only for current legal precedents or law updates related to the agreement type

**Current date**: {current_date}
**{user_context}**

**Response guidelines:**
- Always reference specific parts of the agreement when answering
- Use simple, clear language to explain complex legal terms
- If uncertain about a clause, suggest consulting a legal professional
- Never provide legal advice, only explanations
{agreement_context}
**Remember: you can ONLY discuss this specific agreement. Decline all other requests politely.**"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_includes_summary() {
        let prompt = build_system_prompt(Some("Clause 7: either party may terminate"), None);
        assert!(prompt.contains("Clause 7: either party may terminate"));
        assert!(prompt.contains("Anonymous user"));
    }

    #[test]
    fn prompt_without_summary_asks_for_upload() {
        let prompt = build_system_prompt(None, None);
        assert!(prompt.contains("No agreement summary provided yet"));
    }

    #[test]
    fn prompt_includes_authenticated_user() {
        let user = AuthenticatedUser {
            uid: "u-42".into(),
            email: Some("sam@example.com".into()),
        };
        let prompt = build_system_prompt(None, Some(&user));
        assert!(prompt.contains("sam@example.com"));
        assert!(prompt.contains("u-42"));
    }
}
