//! Opening lines shown before the visitor says anything.

pub const GREETINGS: &[&str] = &[
    "Hi there! I'm GrantBot. Tell me about your organization and I'll help you find grants that fit.",
    "Hello! Looking for funding? Describe your project and I'll search for matching grant opportunities.",
    "Welcome! I can help you discover grants by focus area, eligibility, deadline or amount. What are you working on?",
    "Hi! Ask me about grant opportunities and I'll point you to the ones worth your time.",
];

/// Pick one greeting for the lifetime of a session.
pub fn pick_greeting() -> &'static str {
    GREETINGS[rand::random_range(0..GREETINGS.len())]
}
