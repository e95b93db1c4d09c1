//! Token stream and reconstruction tests for the grub tokenizer.

use imageforge::grub::{tokenize_grub_config, SubWordKind, Token, TokenKind};

fn reconstruct(tokens: &[Token]) -> String {
    tokens.iter().map(|t| t.raw_content.as_str()).collect()
}

#[test]
fn test_kernel_line_token_stream() {
    let input = "set default=\"0\"\nlinux /boot/vmlinuz $kernelopts\n";

    let tokens = tokenize_grub_config(input).unwrap();

    let expected: Vec<(TokenKind, &str)> = vec![
        (TokenKind::Word, "set"),
        (TokenKind::Space, " "),
        (TokenKind::Word, "default=\"0\""),
        (TokenKind::Newline, "\n"),
        (TokenKind::Word, "linux"),
        (TokenKind::Space, " "),
        (TokenKind::Word, "/boot/vmlinuz"),
        (TokenKind::Space, " "),
        (TokenKind::Word, "$kernelopts"),
        (TokenKind::Newline, "\n"),
    ];

    let actual: Vec<(TokenKind, &str)> = tokens
        .iter()
        .map(|t| (t.kind, t.raw_content.as_str()))
        .collect();
    assert_eq!(actual, expected);

    assert_eq!(reconstruct(&tokens), input);
}

#[test]
fn test_kernelopts_is_a_variable_expansion() {
    let tokens = tokenize_grub_config("linux /boot/vmlinuz $kernelopts\n").unwrap();

    let word = &tokens[4];
    assert_eq!(word.kind, TokenKind::Word);
    assert_eq!(word.sub_words.len(), 1);
    assert_eq!(word.sub_words[0].kind, SubWordKind::VarExpansion);
    assert_eq!(word.sub_words[0].value, "kernelopts");
}

#[test]
fn test_spans_cover_the_input_contiguously() {
    let input = "menuentry \"My OS\" {\n\tlinux /vmlinuz ${opts}\n}\n";

    let tokens = tokenize_grub_config(input).unwrap();

    let mut next_index = 0;
    for token in &tokens {
        assert_eq!(token.span.start.index, next_index);
        next_index = token.span.end.index;
    }
    assert_eq!(next_index, input.len());
}

#[test]
fn test_reconstruction_of_a_realistic_config() {
    let input = concat!(
        "# Generated grub configuration\n",
        "set timeout=5\n",
        "set root='hd0,gpt2'\n",
        "search -n -u 1a2b3c4d-5e6f-7081-92a3-b4c5d6e7f809 -s\n",
        "load_env -f ${prefix_path}/grubenv\n",
        "if [ -f  ${config_directory}/custom.cfg ]; then\n",
        "  source ${config_directory}/custom.cfg\n",
        "fi\n",
        "menuentry \"CBL-Mariner\" {\n",
        "\tlinux /boot/vmlinuz-5.15 rd.auto=1 \"$kernelopts\" \\\n",
        "\t\tcrashkernel=256M\n",
        "\tinitrd /boot/initramfs-5.15.img\n",
        "}\n"
    );

    let tokens = tokenize_grub_config(input).unwrap();
    assert_eq!(reconstruct(&tokens), input);
}

#[test]
fn test_error_carries_source_location() {
    let err = tokenize_grub_config("set a=1\nset b=\"unterminated\n").unwrap_err();

    let message = format!("{err:#}");
    assert!(message.contains("end-of-file during double-quoted string"));
    assert!(message.contains("(3:1)"));
}
