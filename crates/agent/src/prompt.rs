use chrono::NaiveDate;
use invoicey_core::ClientRoster;

const DATE_FORMAT: &str = "%Y-%m-%d";

const ROLE: &str = "You help a remodeling contractor turn a conversation about completed or \
planned work into invoice line items. Ask short follow-up questions when the scope, the client \
or an amount is unclear. Never invent prices; use only amounts the user states.";

/// Builds the system instruction for one turn: the block format, the known
/// client names and today's date.
pub fn system_instruction(roster: &ClientRoster, today: NaiveDate, tag: &str) -> String {
    let mut instruction = String::with_capacity(1024);
    instruction.push_str(ROLE);
    instruction.push_str("\n\n");

    instruction.push_str(&format!(
        "When you have invoice details to record, end your reply with exactly one fenced block \
opened by ```{tag} and closed by ```. The block body is a single JSON object. Every key is \
optional; include only what the user told you:\n"
    ));
    instruction.push_str(
        "- client_name: text, the client's name as the user said it\n\
- invoice_date: text, YYYY-MM-DD\n\
- due_date: text, YYYY-MM-DD\n\
- labor_items: array of {\"description\": text, \"amount\": number in dollars}\n\
- material_items: array of {\"description\": text, \"amount\": number in dollars}\n\
- tax_rate: number, percent (8.25 means 8.25%)\n\
- notes: text\n",
    );
    instruction.push_str(
        "Send the complete list of labor_items or material_items each time you include one, \
because it replaces what was recorded before. Do not mention the block in your prose.\n\n",
    );

    if roster.is_empty() {
        instruction.push_str("There are no saved clients yet.\n");
    } else {
        instruction.push_str("Known clients:\n");
        for name in roster.names() {
            instruction.push_str(&format!("- {name}\n"));
        }
    }

    instruction.push_str(&format!("\nToday's date is {}.", today.format(DATE_FORMAT)));
    instruction
}
