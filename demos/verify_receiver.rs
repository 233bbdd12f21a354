use webhook_delivery::{compute_signature, verify_signature};

fn main() {
    let secret = b"supersecret";
    let payload = br#"{"id":123}"#;
    let timestamp = "1700000000";

    // What the sender put in X-Webhook-Signature.
    let signature = compute_signature(secret, payload, Some(timestamp));

    let valid = verify_signature(secret, payload, Some(timestamp), &signature);
    let tampered = verify_signature(secret, br#"{"id":124}"#, Some(timestamp), &signature);

    println!("valid={valid} tampered={tampered}");
}
