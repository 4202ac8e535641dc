use super::{
    ast::{
        BinaryOp, CtorDecl, Exp, FuncDecl, Ident, Item, ModSpec, Param, ParamFlow, ProcDecl, Stmt,
        TypeDecl, TypeSpec, Visibility,
    },
    lexer::{Keyword, LexError, Lexer, Token, TokenKind},
    OptPos, Placed, SourceFile,
};

#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub pos: OptPos,
}

impl ParseError {
    fn new(message: impl Into<String>, pos: OptPos) -> Self {
        Self {
            message: message.into(),
            pos,
        }
    }
}

impl From<LexError> for ParseError {
    fn from(err: LexError) -> Self {
        Self {
            message: err.message,
            pos: Some(err.pos),
        }
    }
}

#[derive(Debug)]
pub struct Parser<'source> {
    lexer: Lexer<'source>,
}

/// Parses a whole source file into top level items. A malformed item is
/// reported and dropped; parsing resynchronises at the next item keyword so
/// one bad declaration does not hide the rest of the file.
pub fn parse_items(source: &SourceFile) -> (Vec<Placed<Item>>, Vec<ParseError>) {
    let mut parser = Parser {
        lexer: Lexer::new(source),
    };

    let mut items = Vec::new();
    let mut errors = Vec::new();

    loop {
        match parser.peek() {
            Ok(None) => break,
            Ok(Some(_)) => match parser.parse_item() {
                Ok(item) => items.push(item),
                Err(err) => {
                    errors.push(err);
                    parser.recover_to_item_start();
                }
            },
            Err(err) => {
                errors.push(err);
                parser.recover_to_item_start();
            }
        }
    }

    (items, errors)
}

impl<'source> Parser<'source> {
    fn peek(&mut self) -> Result<Option<Token>, ParseError> {
        Ok(self.lexer.peek()?)
    }

    fn next(&mut self) -> Result<Option<Token>, ParseError> {
        Ok(self.lexer.next()?)
    }

    fn here(&mut self) -> OptPos {
        Some(self.lexer.position())
    }

    fn expect_next(&mut self, expecting: &str) -> Result<Token, ParseError> {
        let pos = self.here();
        self.next()?
            .ok_or_else(|| ParseError::new(format!("Expected {expecting} but reached end of file"), pos))
    }

    fn expect_next_to_be(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        let token = self.expect_next(&format!("{kind:?}"))?;

        if token.kind != kind {
            return Err(ParseError::new(
                format!("Expected {:?} but found {:?}", kind, token.kind),
                Some(token.pos),
            ));
        }

        Ok(token)
    }

    fn expect_keyword(&mut self, keyword: Keyword) -> Result<Token, ParseError> {
        self.expect_next_to_be(TokenKind::Keyword(keyword))
    }

    fn expect_ident(&mut self, expecting: &str) -> Result<(Ident, OptPos), ParseError> {
        let token = self.expect_next(expecting)?;

        match token.kind {
            TokenKind::Ident(symbol) => Ok((symbol, Some(token.pos))),
            other => Err(ParseError::new(
                format!("Expected {expecting} but found {other:?}"),
                Some(token.pos),
            )),
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> Result<bool, ParseError> {
        if self.peek()?.is_some_and(|t| &t.kind == kind) {
            self.next()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn eat_keyword(&mut self, keyword: Keyword) -> Result<bool, ParseError> {
        self.eat(&TokenKind::Keyword(keyword))
    }

    /// Skip tokens until something that can begin a top level item.
    fn recover_to_item_start(&mut self) {
        loop {
            match self.lexer.peek() {
                Ok(None) => break,
                Ok(Some(Token {
                    kind:
                        TokenKind::Keyword(
                            Keyword::Module
                            | Keyword::Type
                            | Keyword::Resource
                            | Keyword::Use
                            | Keyword::From
                            | Keyword::Pub
                            | Keyword::Proc
                            | Keyword::Func
                            | Keyword::Test,
                        ),
                    ..
                })) => break,
                _ => {
                    // A stray character the lexer refuses to consume would
                    // otherwise stall recovery here.
                    if self.lexer.next().is_err() {
                        self.lexer.skip_char();
                    }
                }
            }
        }
    }

    /* Items */

    fn parse_item(&mut self) -> Result<Placed<Item>, ParseError> {
        let visibility = if self.eat_keyword(Keyword::Pub)? {
            Visibility::Public
        } else {
            Visibility::Private
        };

        let token = self.expect_next("a declaration")?;
        let pos = Some(token.pos.clone());

        let item = match token.kind {
            TokenKind::Keyword(Keyword::Module) => {
                let (name, _) = self.expect_ident("module name")?;
                let mut items = Vec::new();
                while !self.eat_keyword(Keyword::End)? {
                    if self.peek()?.is_none() {
                        return Err(ParseError::new(
                            "Unterminated module declaration",
                            pos,
                        ));
                    }
                    items.push(self.parse_item()?);
                }
                Item::Module { name, items }
            }
            TokenKind::Keyword(Keyword::Type) => Item::Type(self.parse_type_decl(visibility)?),
            TokenKind::Keyword(Keyword::Resource) => {
                let (name, _) = self.expect_ident("resource name")?;
                self.expect_next_to_be(TokenKind::Colon)?;
                let ty = self.parse_type_spec()?;
                Item::Resource {
                    name,
                    ty,
                    visibility,
                }
            }
            TokenKind::Keyword(Keyword::Use) => {
                let path = self.parse_mod_path()?;
                Item::Use {
                    path,
                    visibility,
                    items: None,
                }
            }
            TokenKind::Keyword(Keyword::From) => {
                let path = self.parse_mod_path()?;
                self.expect_keyword(Keyword::Use)?;

                let mut items = Vec::new();
                loop {
                    let (item, _) = self.expect_ident("imported item name")?;
                    items.push(item);
                    if !self.eat(&TokenKind::Comma)? {
                        break;
                    }
                }

                Item::Use {
                    path,
                    visibility,
                    items: Some(items),
                }
            }
            TokenKind::Keyword(Keyword::Test) => {
                self.expect_keyword(Keyword::Proc)?;
                Item::Proc(self.parse_proc_decl(visibility, true)?)
            }
            TokenKind::Keyword(Keyword::Proc) => {
                Item::Proc(self.parse_proc_decl(visibility, false)?)
            }
            TokenKind::Keyword(Keyword::Func) => Item::Func(self.parse_func_decl(visibility)?),
            other => {
                return Err(ParseError::new(
                    format!("Expected a declaration but found {other:?}"),
                    pos,
                ))
            }
        };

        Ok(Placed::new(item, pos))
    }

    /// type name ctor1(f1:ty, f2:ty) | ctor2 ... end
    fn parse_type_decl(&mut self, visibility: Visibility) -> Result<TypeDecl, ParseError> {
        let (name, _) = self.expect_ident("type name")?;

        let mut params = Vec::new();
        if self.eat(&TokenKind::OpenParen)? {
            loop {
                let (param, _) = self.expect_ident("type parameter")?;
                params.push(param);
                if !self.eat(&TokenKind::Comma)? {
                    break;
                }
            }
            self.expect_next_to_be(TokenKind::CloseParen)?;
        }

        let mut ctors = Vec::new();
        loop {
            let pos = self.here();
            let (ctor_name, _) = self.expect_ident("constructor name")?;

            let mut fields = Vec::new();
            if self.eat(&TokenKind::OpenParen)? {
                loop {
                    fields.push(self.parse_param()?);
                    if !self.eat(&TokenKind::Comma)? {
                        break;
                    }
                }
                self.expect_next_to_be(TokenKind::CloseParen)?;
            }

            ctors.push(Placed::new(
                CtorDecl {
                    name: ctor_name,
                    fields,
                },
                pos,
            ));

            if !self.eat(&TokenKind::Bar)? {
                break;
            }
        }
        self.expect_keyword(Keyword::End)?;

        Ok(TypeDecl {
            name,
            params,
            ctors,
            visibility,
        })
    }

    fn parse_proc_decl(
        &mut self,
        visibility: Visibility,
        is_test: bool,
    ) -> Result<ProcDecl, ParseError> {
        let (name, _) = self.expect_ident("procedure name")?;
        let params = self.parse_param_list()?;
        let body = self.parse_stmts_until_end()?;

        Ok(ProcDecl {
            name,
            params,
            body,
            visibility,
            is_test,
        })
    }

    /// func name(params):ty = exp
    fn parse_func_decl(&mut self, visibility: Visibility) -> Result<FuncDecl, ParseError> {
        let (name, _) = self.expect_ident("function name")?;
        let params = self.parse_param_list()?;
        self.expect_next_to_be(TokenKind::Colon)?;
        let result_ty = self.parse_type_spec()?;
        self.expect_next_to_be(TokenKind::Equals)?;
        let body = self.parse_exp(false)?;

        Ok(FuncDecl {
            name,
            params,
            result_ty,
            body,
            visibility,
        })
    }

    fn parse_param_list(&mut self) -> Result<Vec<Param>, ParseError> {
        let mut params = Vec::new();

        self.expect_next_to_be(TokenKind::OpenParen)?;
        if self.eat(&TokenKind::CloseParen)? {
            return Ok(params);
        }

        loop {
            params.push(self.parse_param()?);
            if !self.eat(&TokenKind::Comma)? {
                break;
            }
        }
        self.expect_next_to_be(TokenKind::CloseParen)?;

        Ok(params)
    }

    fn parse_param(&mut self) -> Result<Param, ParseError> {
        let flow = if self.eat(&TokenKind::Question)? {
            ParamFlow::Out
        } else if self.eat(&TokenKind::Bang)? {
            ParamFlow::InOut
        } else {
            ParamFlow::In
        };

        let (name, pos) = self.expect_ident("parameter name")?;

        let ty = if self.eat(&TokenKind::Colon)? {
            self.parse_type_spec()?
        } else {
            TypeSpec::Unspecified
        };

        Ok(Param {
            name,
            ty,
            flow,
            pos,
        })
    }

    fn parse_mod_path(&mut self) -> Result<ModSpec, ParseError> {
        let (first, _) = self.expect_ident("module path")?;
        let mut segments = vec![first];

        while self.eat(&TokenKind::Dot)? {
            let (next, _) = self.expect_ident("module path segment")?;
            segments.push(next);
        }

        Ok(ModSpec(segments))
    }

    /// Well-known unqualified type names resolve to the builtin module;
    /// anything else is looked up in scope later.
    fn parse_type_spec(&mut self) -> Result<TypeSpec, ParseError> {
        let path = self.parse_mod_path()?;

        if path.0.len() == 1 {
            let name = path.0[0].value();
            match name {
                "int" => return Ok(TypeSpec::int()),
                "float" => return Ok(TypeSpec::float()),
                "bool" => return Ok(TypeSpec::boolean()),
                "string" => return Ok(TypeSpec::string()),
                "char" => return Ok(TypeSpec::char()),
                "address" => return Ok(TypeSpec::address()),
                "phantom" => return Ok(TypeSpec::phantom()),
                _ => {}
            }
        }

        let name = *path.0.last().unwrap();
        let mod_spec = ModSpec(path.0[..path.0.len() - 1].to_vec());

        Ok(TypeSpec::Type {
            mod_spec,
            name,
            params: Vec::new(),
        })
    }

    /* Statements */

    fn parse_stmts_until_end(&mut self) -> Result<Vec<Placed<Stmt>>, ParseError> {
        let mut stmts = Vec::new();
        while !self.eat_keyword(Keyword::End)? {
            if self.peek()?.is_none() {
                return Err(ParseError::new(
                    "Reached end of file while looking for `end`",
                    self.here(),
                ));
            }
            stmts.push(self.parse_stmt()?);
        }
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Placed<Stmt>, ParseError> {
        let token = self.expect_next("a statement")?;
        let pos = Some(token.pos.clone());

        let stmt = match token.kind.clone() {
            TokenKind::Keyword(Keyword::If) => {
                let cond = self.parse_exp(true)?;
                self.expect_keyword(Keyword::Then)?;

                let mut then_stmts = Vec::new();
                let mut else_stmts = Vec::new();

                loop {
                    if self.eat_keyword(Keyword::End)? {
                        break;
                    }
                    if self.eat_keyword(Keyword::Else)? {
                        else_stmts = self.parse_stmts_until_end()?;
                        break;
                    }
                    if self.peek()?.is_none() {
                        return Err(ParseError::new("Unterminated `if` statement", pos));
                    }
                    then_stmts.push(self.parse_stmt()?);
                }

                Stmt::If {
                    cond,
                    then_stmts,
                    else_stmts,
                }
            }
            TokenKind::Keyword(Keyword::Do) => Stmt::Loop {
                body: self.parse_stmts_until_end()?,
            },
            TokenKind::Keyword(Keyword::While) => Stmt::While {
                cond: self.parse_exp(true)?,
            },
            TokenKind::Keyword(Keyword::Until) => Stmt::Until {
                cond: self.parse_exp(true)?,
            },
            TokenKind::Keyword(Keyword::Break) => Stmt::Break,
            TokenKind::Keyword(Keyword::Next) => Stmt::Next,
            TokenKind::Keyword(Keyword::Foreign) => {
                let (lang, _) = self.expect_ident("foreign language")?;

                let mut words = Vec::new();
                while let Some(Token {
                    kind: TokenKind::Ident(word),
                    ..
                }) = self.peek()?
                {
                    words.push(word.value().to_owned());
                    self.next()?;
                }

                if words.is_empty() {
                    return Err(ParseError::new("Expected foreign operation name", pos));
                }
                let name = words.remove(0);

                let args = self.parse_call_args()?;

                Stmt::Foreign {
                    lang: lang.value().to_owned(),
                    name,
                    flags: words,
                    args,
                }
            }
            _ => {
                // A call or an assignment; both start with an expression
                let lhs = self.parse_exp_starting(token, false)?;

                if self.eat(&TokenKind::Equals)? {
                    let rhs = self.parse_exp(false)?;
                    Stmt::Assign { lhs, rhs }
                } else {
                    match lhs.value {
                        Exp::Call { module, name, args } => Stmt::Call { module, name, args },
                        other => {
                            return Err(ParseError::new(
                                format!("Expected a statement but found expression {other:?}"),
                                pos,
                            ))
                        }
                    }
                }
            }
        };

        Ok(Placed::new(stmt, pos))
    }

    fn parse_call_args(&mut self) -> Result<Vec<Placed<Exp>>, ParseError> {
        let mut args = Vec::new();

        self.expect_next_to_be(TokenKind::OpenParen)?;
        if self.eat(&TokenKind::CloseParen)? {
            return Ok(args);
        }

        loop {
            args.push(self.parse_exp(true)?);
            if !self.eat(&TokenKind::Comma)? {
                break;
            }
        }
        self.expect_next_to_be(TokenKind::CloseParen)?;

        Ok(args)
    }

    /* Expressions */

    /// Precedence climbing. `allow_eq` controls whether a bare `=` is an
    /// equality test; it is off on either side of an assignment statement.
    fn parse_exp(&mut self, allow_eq: bool) -> Result<Placed<Exp>, ParseError> {
        let token = self.expect_next("an expression")?;
        self.parse_exp_starting(token, allow_eq)
    }

    fn parse_exp_starting(
        &mut self,
        first: Token,
        allow_eq: bool,
    ) -> Result<Placed<Exp>, ParseError> {
        let lhs = self.parse_sum_starting(first)?;
        self.parse_comparison_rest(lhs, allow_eq)
    }

    fn parse_comparison_rest(
        &mut self,
        lhs: Placed<Exp>,
        allow_eq: bool,
    ) -> Result<Placed<Exp>, ParseError> {
        let op = match self.peek()? {
            Some(t) => match t.kind {
                TokenKind::Equals if allow_eq => BinaryOp::Equal,
                TokenKind::NotEquals => BinaryOp::NotEqual,
                TokenKind::Less => BinaryOp::Less,
                TokenKind::LessEq => BinaryOp::LessEq,
                TokenKind::Greater => BinaryOp::Greater,
                TokenKind::GreaterEq => BinaryOp::GreaterEq,
                _ => return Ok(lhs),
            },
            None => return Ok(lhs),
        };
        self.next()?;

        let rhs = self.parse_sum()?;
        let pos = lhs.pos.clone();

        Ok(Placed::new(
            Exp::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            pos,
        ))
    }

    fn parse_sum(&mut self) -> Result<Placed<Exp>, ParseError> {
        let token = self.expect_next("an expression")?;
        self.parse_sum_starting(token)
    }

    fn parse_sum_starting(&mut self, first: Token) -> Result<Placed<Exp>, ParseError> {
        let mut lhs = self.parse_term_starting(first)?;

        loop {
            let op = match self.peek()? {
                Some(t) => match t.kind {
                    TokenKind::Plus => BinaryOp::Add,
                    TokenKind::Minus => BinaryOp::Subtract,
                    _ => break,
                },
                None => break,
            };
            self.next()?;

            let rhs = self.parse_term()?;
            let pos = lhs.pos.clone();
            lhs = Placed::new(
                Exp::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            );
        }

        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Placed<Exp>, ParseError> {
        let token = self.expect_next("an expression")?;
        self.parse_term_starting(token)
    }

    fn parse_term_starting(&mut self, first: Token) -> Result<Placed<Exp>, ParseError> {
        let mut lhs = self.parse_factor_starting(first)?;

        loop {
            let op = match self.peek()? {
                Some(t) => match t.kind {
                    TokenKind::Star => BinaryOp::Multiply,
                    TokenKind::Slash => BinaryOp::Divide,
                    TokenKind::Keyword(Keyword::Mod) => BinaryOp::Modulus,
                    _ => break,
                },
                None => break,
            };
            self.next()?;

            let token = self.expect_next("an expression")?;
            let rhs = self.parse_factor_starting(token)?;
            let pos = lhs.pos.clone();
            lhs = Placed::new(
                Exp::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            );
        }

        Ok(lhs)
    }

    fn parse_factor_starting(&mut self, first: Token) -> Result<Placed<Exp>, ParseError> {
        let pos = Some(first.pos.clone());

        let exp = match first.kind {
            TokenKind::IntLit(value) => Placed::new(Exp::IntLit(value), pos),
            TokenKind::FloatLit(value) => Placed::new(Exp::FloatLit(value), pos),
            TokenKind::StringLit(value) => Placed::new(Exp::StringLit(value), pos),
            TokenKind::CharLit(value) => Placed::new(Exp::CharLit(value), pos),
            TokenKind::Keyword(Keyword::True) => Placed::new(
                Exp::Typed {
                    exp: Box::new(Placed::new(Exp::IntLit(1), pos.clone())),
                    ty: TypeSpec::boolean(),
                },
                pos,
            ),
            TokenKind::Keyword(Keyword::False) => Placed::new(
                Exp::Typed {
                    exp: Box::new(Placed::new(Exp::IntLit(0), pos.clone())),
                    ty: TypeSpec::boolean(),
                },
                pos,
            ),
            TokenKind::OpenParen => {
                let inner = self.parse_exp(true)?;
                self.expect_next_to_be(TokenKind::CloseParen)?;
                inner
            }
            // Unary minus is sugar for subtraction from zero.
            TokenKind::Minus => {
                let operand = self.expect_next("an expression")?;
                let operand = self.parse_factor_starting(operand)?;
                Placed::new(
                    Exp::Binary {
                        op: BinaryOp::Subtract,
                        lhs: Box::new(Placed::new(Exp::IntLit(0), pos.clone())),
                        rhs: Box::new(operand),
                    },
                    pos,
                )
            }
            TokenKind::Question => {
                let (name, _) = self.expect_ident("variable after `?`")?;
                Placed::new(
                    Exp::Var {
                        name,
                        flow: ParamFlow::Out,
                    },
                    pos,
                )
            }
            TokenKind::Bang => {
                let (name, _) = self.expect_ident("variable after `!`")?;
                Placed::new(
                    Exp::Var {
                        name,
                        flow: ParamFlow::InOut,
                    },
                    pos,
                )
            }
            TokenKind::Ident(first_name) => {
                let mut segments = vec![first_name];
                while self.eat(&TokenKind::Dot)? {
                    let (next, _) = self.expect_ident("name segment")?;
                    segments.push(next);
                }

                let name = *segments.last().unwrap();
                let module = if segments.len() > 1 {
                    Some(ModSpec(segments[..segments.len() - 1].to_vec()))
                } else {
                    None
                };

                if self.peek()?.is_some_and(|t| t.kind == TokenKind::OpenParen) {
                    let args = self.parse_call_args()?;
                    Placed::new(Exp::Call { module, name, args }, pos)
                } else if let Some(module) = module {
                    return Err(ParseError::new(
                        format!("Unexpected qualified name {module}.{name} outside a call"),
                        pos,
                    ));
                } else {
                    Placed::new(
                        Exp::Var {
                            name,
                            flow: ParamFlow::In,
                        },
                        pos,
                    )
                }
            }
            other => {
                return Err(ParseError::new(
                    format!("Expected an expression but found {other:?}"),
                    pos,
                ))
            }
        };

        // `e : Type` ascription binds tighter than any operator
        if self.eat(&TokenKind::Colon)? {
            let ty = self.parse_type_spec()?;
            let pos = exp.pos.clone();
            return Ok(Placed::new(
                Exp::Typed {
                    exp: Box::new(exp),
                    ty,
                },
                pos,
            ));
        }

        Ok(exp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::intern::InternedSymbol;

    fn parse_ok(input: &str) -> Vec<Placed<Item>> {
        let source = SourceFile::from_memory(input);
        let (items, errors) = parse_items(&source);
        assert!(errors.is_empty(), "unexpected parse errors: {errors:?}");
        items
    }

    #[test]
    fn parses_proc_with_flows() {
        let items = parse_ok("proc add1(x:int, ?y:int) ?y = x + 1 end");
        assert_eq!(items.len(), 1);

        let Item::Proc(decl) = &items[0].value else {
            panic!("expected a proc item");
        };
        assert_eq!(decl.name.value(), "add1");
        assert_eq!(decl.params.len(), 2);
        assert_eq!(decl.params[0].flow, ParamFlow::In);
        assert_eq!(decl.params[1].flow, ParamFlow::Out);
        assert_eq!(decl.body.len(), 1);
        assert!(matches!(decl.body[0].value, Stmt::Assign { .. }));
    }

    #[test]
    fn parses_if_and_loop() {
        let items = parse_ok(
            "proc p(x:int, ?y:int)\n\
             if x < 10 then ?y = 1 else ?y = 2 end\n\
             do until x > 3 next end\n\
             end",
        );

        let Item::Proc(decl) = &items[0].value else {
            panic!("expected a proc item");
        };
        assert!(matches!(decl.body[0].value, Stmt::If { .. }));
        assert!(matches!(decl.body[1].value, Stmt::Loop { .. }));
    }

    #[test]
    fn parses_foreign_with_flags() {
        let items = parse_ok("proc p(x:int, ?b:bool) foreign llvm icmp slt(x, 0, ?b) end");

        let Item::Proc(decl) = &items[0].value else {
            panic!("expected a proc item");
        };
        let Stmt::Foreign {
            lang, name, flags, ..
        } = &decl.body[0].value
        else {
            panic!("expected a foreign statement");
        };
        assert_eq!(lang, "llvm");
        assert_eq!(name, "icmp");
        assert_eq!(flags, &vec!["slt".to_owned()]);
    }

    #[test]
    fn parses_type_with_ctors() {
        let items = parse_ok("pub type pair first(a:int, b:int) | nothing end");

        let Item::Type(decl) = &items[0].value else {
            panic!("expected a type item");
        };
        assert_eq!(decl.visibility, Visibility::Public);
        assert_eq!(decl.ctors.len(), 2);
        assert_eq!(decl.ctors[0].value.fields.len(), 2);
        assert!(decl.ctors[1].value.fields.is_empty());
    }

    #[test]
    fn selective_import_lists_its_items() {
        let items = parse_ok("from util use min, max");

        let Item::Use {
            path,
            items: Some(names),
            ..
        } = &items[0].value
        else {
            panic!("expected a selective use item");
        };
        assert_eq!(path.to_string(), "util");
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn bad_item_is_dropped_and_rest_parses() {
        let source = SourceFile::from_memory("proc 123 end proc ok(x:int) end");
        let (items, errors) = parse_items(&source);

        assert_eq!(errors.len(), 1);
        assert_eq!(items.len(), 1);
        let Item::Proc(decl) = &items[0].value else {
            panic!("expected a proc item");
        };
        assert_eq!(decl.name, InternedSymbol::new("ok"));
    }

    #[test]
    fn func_is_parsed_with_result_type() {
        let items = parse_ok("func double(x:int):int = x + x");

        let Item::Func(decl) = &items[0].value else {
            panic!("expected a func item");
        };
        assert_eq!(decl.result_ty, TypeSpec::int());
        assert!(matches!(decl.body.value, Exp::Binary { .. }));
    }
}
